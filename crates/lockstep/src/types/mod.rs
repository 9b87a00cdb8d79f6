//! Value types shared by the resolver, the repositories, the lockfile and the
//! installer.

mod artifact_name;
mod candidate;
mod core_metadata;
mod direct_url;
mod entry_point;
mod extra;
mod package_name;
mod py_version;
mod pyspec;
mod record;
mod requirement;
mod rfc822ish;

pub use artifact_name::{
    ArtifactName, ParseArtifactNameError, SDistFilename, SDistFormat, WheelFilename,
};
pub use candidate::{Candidate, CandidateSource, PreparedCandidate};
pub use core_metadata::{DistMetadata, ParseDistMetadataError};
pub use direct_url::{DirectUrl, DirectUrlSource, VcsKind};
pub use entry_point::{EntryPoint, ParseEntryPointError};
pub use extra::{Extra, ParseExtraError};
pub use package_name::{NormalizedPackageName, PackageName, ParsePackageNameError};
pub use py_version::{ParsePyVersionError, PyVersion};
pub use pyspec::{ParsePySpecError, PySpecSet};
pub use record::{Record, RecordEntry};
pub use requirement::{GroupName, ParseRequirementError, Requirement, RequirementSource};
pub use rfc822ish::{ParseRfc822ishError, Rfc822ish};
