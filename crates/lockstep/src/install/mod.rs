//! Installing wheels into an environment, linking cached packages, and the
//! stash-and-commit uninstaller.

mod cached_package;
mod install_paths;
mod launchers;
mod uninstall;

use std::collections::HashSet;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use configparser::ini::Ini;
use data_encoding::BASE64URL_NOPAD;
use miette::Diagnostic;
use rattler_digest::Sha256;
use thiserror::Error;
use zip::result::ZipError;
use zip::ZipArchive;

use crate::types::{
    DirectUrl, EntryPoint, Extra, NormalizedPackageName, Record, RecordEntry, Rfc822ish,
    WheelFilename,
};

pub use cached_package::{CacheLinkMode, CachedPackage, CachedPackageStore};
pub use install_paths::InstallPaths;
pub use launchers::{make_launcher, rewrite_shebangs, shebang_for};
pub use uninstall::{compress_for_rename, RemovePaths, UninstallError};

/// Error raised while installing a wheel.
#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum InstallError {
    #[error("failed to read wheel entry {0}")]
    Zip(String, #[source] ZipError),

    #[error("io error on {0}")]
    IoAt(String, #[source] std::io::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("the wheel has no .dist-info for {0}")]
    MissingDistInfo(NormalizedPackageName),

    #[error("invalid WHEEL file: {0}")]
    InvalidWheelMetadata(String),

    #[error("unsupported wheel format version {0}")]
    UnsupportedWheelVersion(String),

    #[error("RECORD file is invalid")]
    RecordCsv(#[from] csv::Error),

    #[error("RECORD file doesn't match wheel contents: {0}")]
    RecordMismatch(String),

    #[error("unrecognized .data directory entry: {0}")]
    UnsupportedDataDirectory(String),

    #[error("entry_points.txt is invalid: {0}")]
    EntryPointsInvalid(String),

    #[error("failed to serialize direct_url.json")]
    DirectUrlJson(#[from] serde_json::Error),
}

impl InstallError {
    fn from_zip(name: String, error: ZipError) -> Self {
        match error {
            ZipError::Io(io) => InstallError::IoAt(name, io),
            other => InstallError::Zip(name, other),
        }
    }
}

/// Optional behavior for [`install_wheel`].
#[derive(Default)]
pub struct InstallOptions {
    /// Contents of the `INSTALLER` file; nothing is written when `None`.
    pub installer: Option<String>,
    /// Active extras, used to filter extra-gated entry points. `None`
    /// disables the filtering.
    pub extras: Option<HashSet<Extra>>,
    /// Provenance to record as `direct_url.json`.
    pub direct_url: Option<DirectUrl>,
    /// Whether a `REQUESTED` marker is written (the distribution was asked
    /// for directly rather than pulled in as a dependency).
    pub requested: bool,
}

/// The outcome of a wheel installation.
#[derive(Debug)]
pub struct InstalledWheel {
    /// Absolute path of the created `.dist-info` directory.
    pub dist_info: PathBuf,
    /// Every path that was written, relative to site-packages.
    pub record: Record,
}

/// Unpacks a wheel into `dest` following the install scheme, generating
/// entry-point launchers, verifying RECORD hashes along the way, and writing
/// a fresh RECORD covering everything that landed on disk.
pub fn install_wheel(
    wheel_path: &Path,
    wheel_name: &WheelFilename,
    dest: &Path,
    paths: &InstallPaths,
    python: &Path,
    options: &InstallOptions,
) -> Result<InstalledWheel, InstallError> {
    let file = fs_err::File::open(wheel_path)?;
    let mut archive = ZipArchive::new(file.into_parts().0)
        .map_err(|e| InstallError::from_zip(wheel_path.display().to_string(), e))?;

    let distribution: NormalizedPackageName = wheel_name.distribution.clone().into();
    let dist_info_prefix = find_dist_info_prefix(&mut archive, &distribution)?;

    // WHEEL tells us the format version and where the root files belong.
    let wheel_file = format!("{dist_info_prefix}.dist-info/WHEEL");
    let wheel_metadata = read_archive_entry(&mut archive, &wheel_file)?;
    let root_is_purelib = parse_wheel_file(&wheel_metadata)?;

    let record_path = format!("{dist_info_prefix}.dist-info/RECORD");
    let declared = Record::from_reader(
        archive
            .by_name(&record_path)
            .map_err(|e| InstallError::from_zip(record_path.clone(), e))?,
    )?;

    let scripts = Scripts::from_archive(&mut archive, &dist_info_prefix, options.extras.as_ref())?;

    let transformer = CategoryTransformer {
        data_dir: format!("{dist_info_prefix}.data"),
        root_is_purelib,
        paths,
        distribution: wheel_name.distribution.as_str(),
    };
    let site_packages = dest.join(paths.site_packages());
    fs_err::create_dir_all(&site_packages)?;

    let mut written = Vec::new();
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| InstallError::from_zip(format!("<entry {index}>"), e))?;
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            continue;
        };
        let name = relative.display().to_string().replace('\\', "/");

        // RECORD is rewritten at the end; its signature side-cars are not
        // installed at all.
        if name == record_path
            || name == format!("{record_path}.jws")
            || name == format!("{record_path}.p7s")
        {
            continue;
        }

        let Some((destination_rel, is_script)) = transformer.analyze(&relative)? else {
            continue;
        };
        let destination = dest.join(&destination_rel);

        if entry.is_dir() {
            fs_err::create_dir_all(&destination)?;
            continue;
        }

        let executable = entry.unix_mode().map(|m| m & 0o111 != 0).unwrap_or(false);

        let (size, hash) = if is_script {
            if scripts.is_wrapper_script(&destination) {
                // Setuptools-style wrapper scripts are replaced by our own
                // launchers below.
                continue;
            }
            let mut reader = BufReader::new(entry);
            let head = reader
                .fill_buf()
                .map_err(|e| InstallError::IoAt(name.clone(), e))?;
            if head.starts_with(b"#!python") {
                // A script with a `#!python` placeholder becomes a launcher
                // pointing at the target interpreter.
                let mut shebang_line = String::new();
                reader
                    .read_line(&mut shebang_line)
                    .map_err(|e| InstallError::IoAt(name.clone(), e))?;
                let mut body = Vec::new();
                reader
                    .read_to_end(&mut body)
                    .map_err(|e| InstallError::IoAt(name.clone(), e))?;
                let launcher = make_launcher(python, &body);
                let entry = write_file(&destination, &launcher, true)?;
                written.push(record_entry(entry, &destination, &site_packages));
                // Rewriting invalidates the recorded hash, skip the check.
                continue;
            }
            write_streamed(&mut reader, &destination, true)?
        } else {
            write_streamed(&mut entry, &destination, executable)?
        };

        // Verify against the declared RECORD row, when one exists.
        if let Some(declared_entry) = declared.find(&name) {
            if let Some(declared_hash) = &declared_entry.hash {
                if declared_hash != &hash {
                    return Err(InstallError::RecordMismatch(format!(
                        "hash mismatch for {name}: recorded {declared_hash}, actual {hash}"
                    )));
                }
            }
        } else if !name.starts_with(&format!("{dist_info_prefix}.dist-info/")) {
            return Err(InstallError::RecordMismatch(format!(
                "{name} is not listed in RECORD"
            )));
        }

        written.push(record_entry(
            FileDigest {
                hash: Some(hash),
                size: Some(size),
            },
            &destination,
            &site_packages,
        ));
    }

    // Our own launchers for the declared entry points.
    let scripts_dir = dest.join(paths.scripts());
    fs_err::create_dir_all(&scripts_dir)?;
    for entry_point in scripts.console.iter().chain(scripts.gui.iter()) {
        let launcher = make_launcher(python, entry_point.launch_script().as_bytes());
        let destination = scripts_dir.join(&entry_point.script_name);
        let digest = write_file(&destination, &launcher, true)?;
        written.push(record_entry(digest, &destination, &site_packages));
    }

    let dist_info = site_packages.join(format!("{dist_info_prefix}.dist-info"));

    if let Some(installer) = &options.installer {
        let destination = dist_info.join("INSTALLER");
        let digest = write_file(&destination, format!("{}\n", installer.trim()).as_bytes(), false)?;
        written.push(record_entry(digest, &destination, &site_packages));
    }
    if options.requested {
        let destination = dist_info.join("REQUESTED");
        let digest = write_file(&destination, b"", false)?;
        written.push(record_entry(digest, &destination, &site_packages));
    }
    if let Some(direct_url) = &options.direct_url {
        let destination = dist_info.join("direct_url.json");
        let digest = write_file(&destination, &serde_json::to_vec(direct_url)?, false)?;
        written.push(record_entry(digest, &destination, &site_packages));
    }

    // The RECORD lists itself, hashless.
    written.push(RecordEntry {
        path: format!("{dist_info_prefix}.dist-info/RECORD"),
        hash: None,
        size: None,
    });

    let record = Record::from_iter(written);
    record.write_to_path(&site_packages.join(&record_path))?;

    Ok(InstalledWheel { dist_info, record })
}

/// A hash/size pair for a file that was just written.
struct FileDigest {
    hash: Option<String>,
    size: Option<u64>,
}

fn record_entry(digest: FileDigest, destination: &Path, site_packages: &Path) -> RecordEntry {
    let relative = pathdiff::diff_paths(destination, site_packages)
        .unwrap_or_else(|| destination.to_path_buf());
    RecordEntry {
        path: relative.display().to_string().replace('\\', "/"),
        hash: digest.hash,
        size: digest.size,
    }
}

/// Streams a reader to disk, hashing as it goes.
fn write_streamed(
    reader: &mut impl Read,
    destination: &Path,
    executable: bool,
) -> Result<(u64, String), InstallError> {
    if let Some(parent) = destination.parent() {
        fs_err::create_dir_all(parent)?;
    }
    let mut reader = rattler_digest::HashingReader::<_, Sha256>::new(reader);
    let mut file = open_for_write(destination, executable)?;
    let size = std::io::copy(&mut reader, &mut file)
        .map_err(|e| InstallError::IoAt(destination.display().to_string(), e))?;
    let (_, digest) = reader.finalize();
    Ok((size, format!("sha256={}", BASE64URL_NOPAD.encode(&digest))))
}

/// Writes an in-memory blob to disk and returns its digest entry.
fn write_file(
    destination: &Path,
    content: &[u8],
    executable: bool,
) -> Result<FileDigest, InstallError> {
    if let Some(parent) = destination.parent() {
        fs_err::create_dir_all(parent)?;
    }
    let mut file = open_for_write(destination, executable)?;
    file.write_all(content)
        .map_err(|e| InstallError::IoAt(destination.display().to_string(), e))?;
    let digest = rattler_digest::compute_bytes_digest::<Sha256>(content);
    Ok(FileDigest {
        hash: Some(format!("sha256={}", BASE64URL_NOPAD.encode(&digest))),
        size: Some(content.len() as u64),
    })
}

fn open_for_write(destination: &Path, _executable: bool) -> Result<std::fs::File, InstallError> {
    let mut options = fs_err::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use fs_err::os::unix::fs::OpenOptionsExt;
        options.mode(if _executable { 0o755 } else { 0o644 });
    }
    Ok(options
        .open(destination)
        .map_err(|e| InstallError::IoAt(destination.display().to_string(), e))?
        .into_parts()
        .0)
}

/// Locates the `.dist-info` directory for the expected distribution.
fn find_dist_info_prefix<R: Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
    distribution: &NormalizedPackageName,
) -> Result<String, InstallError> {
    let prefix = archive
        .file_names()
        .filter_map(|name| {
            let (dir, rest) = name.split_once('/')?;
            (rest == "WHEEL").then_some(dir)?;
            let stem = dir.strip_suffix(".dist-info")?;
            let (dist_name, _version) = stem.split_once('-')?;
            NormalizedPackageName::from_str(dist_name)
                .ok()
                .filter(|parsed| parsed == distribution)
                .map(|_| stem.to_string())
        })
        .next()
        .ok_or_else(|| InstallError::MissingDistInfo(distribution.clone()))?;
    Ok(prefix)
}

fn read_archive_entry<R: Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<Vec<u8>, InstallError> {
    let mut bytes = Vec::new();
    archive
        .by_name(name)
        .map_err(|e| InstallError::from_zip(name.to_string(), e))?
        .read_to_end(&mut bytes)
        .map_err(|e| InstallError::IoAt(name.to_string(), e))?;
    Ok(bytes)
}

/// Parses a WHEEL document, checking the format version and extracting
/// `Root-Is-Purelib`.
fn parse_wheel_file(raw: &[u8]) -> Result<bool, InstallError> {
    let text = String::from_utf8_lossy(raw);
    let mut parsed = Rfc822ish::from_str(&text)
        .map_err(|e| InstallError::InvalidWheelMetadata(e.to_string()))?;
    let version = parsed
        .take("Wheel-Version")
        .map_err(|e| InstallError::InvalidWheelMetadata(e.to_string()))?;
    if !version.starts_with("1.") {
        return Err(InstallError::UnsupportedWheelVersion(version));
    }
    match parsed
        .take("Root-Is-Purelib")
        .map_err(|e| InstallError::InvalidWheelMetadata(e.to_string()))?
        .to_lowercase()
        .as_str()
    {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(InstallError::InvalidWheelMetadata(format!(
            "expected 'true' or 'false' for Root-Is-Purelib, not '{other}'"
        ))),
    }
}

/// Maps wheel paths to their install categories, per PEP 427: files under
/// `{dist}.data/<category>/` follow the category, everything else goes to
/// purelib or platlib.
struct CategoryTransformer<'a> {
    data_dir: String,
    root_is_purelib: bool,
    paths: &'a InstallPaths,
    distribution: &'a str,
}

impl CategoryTransformer<'_> {
    /// Returns the destination (relative to the environment root) and
    /// whether the file belongs to the scripts category.
    fn analyze(&self, path: &Path) -> Result<Option<(PathBuf, bool)>, InstallError> {
        let (category, rest): (String, &Path) = match path.strip_prefix(&self.data_dir) {
            Ok(data_path) => {
                let mut components = data_path.components();
                match components.next() {
                    Some(Component::Normal(category)) => (
                        category.to_string_lossy().into_owned(),
                        components.as_path(),
                    ),
                    // The data directory itself.
                    _ => return Ok(None),
                }
            }
            Err(_) => {
                let category = if self.root_is_purelib {
                    "purelib"
                } else {
                    "platlib"
                };
                (category.to_string(), path)
            }
        };

        match self.paths.match_category(&category, self.distribution) {
            Some(base) => Ok(Some((base.join(rest), category == "scripts"))),
            None => Err(InstallError::UnsupportedDataDirectory(category)),
        }
    }
}

/// The entry points declared in `entry_points.txt`.
#[derive(Debug, Default)]
struct Scripts {
    console: Vec<EntryPoint>,
    gui: Vec<EntryPoint>,
}

impl Scripts {
    fn from_archive<R: Read + std::io::Seek>(
        archive: &mut ZipArchive<R>,
        dist_info_prefix: &str,
        extras: Option<&HashSet<Extra>>,
    ) -> Result<Self, InstallError> {
        let name = format!("{dist_info_prefix}.dist-info/entry_points.txt");
        let contents = match archive.by_name(&name) {
            Err(ZipError::FileNotFound) => return Ok(Scripts::default()),
            Err(e) => return Err(InstallError::from_zip(name, e)),
            Ok(mut file) => {
                let mut text = String::new();
                file.read_to_string(&mut text)
                    .map_err(|e| InstallError::IoAt(name.clone(), e))?;
                text
            }
        };

        let mut sections = Ini::new_cs()
            .read(contents)
            .map_err(|e| InstallError::EntryPointsInvalid(e.to_string()))?;

        let mut parse_section = |section: &str| -> Result<Vec<EntryPoint>, InstallError> {
            let mut result = Vec::new();
            for (script_name, value) in sections.remove(section).into_iter().flatten() {
                let value = value.ok_or_else(|| {
                    InstallError::EntryPointsInvalid(format!("missing value for {script_name}"))
                })?;
                match EntryPoint::parse(script_name.clone(), &value, extras) {
                    Ok(Some(entry_point)) => result.push(entry_point),
                    Ok(None) => {}
                    Err(e) => {
                        return Err(InstallError::EntryPointsInvalid(format!(
                            "{script_name}: {e}"
                        )))
                    }
                }
            }
            Ok(result)
        };

        Ok(Scripts {
            console: parse_section("console_scripts")?,
            gui: parse_section("gui_scripts")?,
        })
    }

    fn names(&self) -> impl Iterator<Item = &str> {
        self.console
            .iter()
            .chain(self.gui.iter())
            .map(|entry_point| entry_point.script_name.as_str())
    }

    /// Whether a path is a setuptools-generated wrapper for one of our entry
    /// points.
    fn is_wrapper_script(&self, path: &Path) -> bool {
        let Some(file_name) = path.file_name().map(|n| n.to_string_lossy()) else {
            return false;
        };
        let stem = file_name
            .strip_suffix(".exe")
            .or_else(|| file_name.strip_suffix("-script.py"))
            .unwrap_or(&file_name);
        self.names().any(|name| name == stem)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write as _;
    use zip::write::FileOptions;

    /// Builds a small wheel in a temp directory and returns its path.
    pub(crate) fn make_test_wheel(
        dir: &Path,
        name: &str,
        version: &str,
        entry_points: Option<&str>,
    ) -> PathBuf {
        let filename = format!("{name}-{version}-py3-none-any.whl");
        let path = dir.join(&filename);
        let file = fs_err::File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file.into_parts().0);
        let options: FileOptions = FileOptions::default();

        let module = format!("{name}/__init__.py");
        let module_body = b"__version__ = \"0.0\"\n";
        writer.start_file(&module, options).unwrap();
        writer.write_all(module_body).unwrap();

        let dist_info = format!("{name}-{version}.dist-info");
        writer
            .start_file(format!("{dist_info}/METADATA"), options)
            .unwrap();
        writer
            .write_all(format!("Metadata-Version: 2.1\nName: {name}\nVersion: {version}\n").as_bytes())
            .unwrap();
        writer
            .start_file(format!("{dist_info}/WHEEL"), options)
            .unwrap();
        writer
            .write_all(b"Wheel-Version: 1.0\nGenerator: test\nRoot-Is-Purelib: true\nTag: py3-none-any\n")
            .unwrap();
        if let Some(entry_points) = entry_points {
            writer
                .start_file(format!("{dist_info}/entry_points.txt"), options)
                .unwrap();
            writer.write_all(entry_points.as_bytes()).unwrap();
        }

        // RECORD with a correct hash for the module file.
        let digest = rattler_digest::compute_bytes_digest::<Sha256>(module_body);
        let metadata_line = format!("{dist_info}/METADATA,,\n{dist_info}/WHEEL,,\n");
        let record = format!(
            "{module},sha256={},{}\n{metadata_line}{dist_info}/RECORD,,\n",
            BASE64URL_NOPAD.encode(&digest),
            module_body.len(),
        );
        writer
            .start_file(format!("{dist_info}/RECORD"), options)
            .unwrap();
        writer.write_all(record.as_bytes()).unwrap();
        writer.finish().unwrap();
        path
    }

    fn wheel_name(name: &str, version: &str) -> WheelFilename {
        format!("{name}-{version}-py3-none-any.whl").parse().unwrap()
    }

    #[test]
    fn installs_a_wheel_and_writes_record() {
        let scratch = tempfile::tempdir().unwrap();
        let wheel = make_test_wheel(
            scratch.path(),
            "demo",
            "1.0",
            Some("[console_scripts]\ndemo = demo:main\n"),
        );
        let dest = tempfile::tempdir().unwrap();
        let paths = InstallPaths::for_venv(3, 11, false);

        let installed = install_wheel(
            &wheel,
            &wheel_name("demo", "1.0"),
            dest.path(),
            &paths,
            Path::new("/usr/bin/python3"),
            &InstallOptions {
                installer: Some("lockstep".into()),
                ..Default::default()
            },
        )
        .unwrap();

        let site_packages = dest.path().join(paths.site_packages());
        assert!(site_packages.join("demo/__init__.py").is_file());
        assert!(installed.dist_info.join("RECORD").is_file());
        assert_eq!(
            fs_err::read_to_string(installed.dist_info.join("INSTALLER")).unwrap(),
            "lockstep\n"
        );

        // The launcher exists, is recorded, and points at the interpreter.
        let launcher = dest.path().join(paths.scripts()).join("demo");
        let launcher_text = fs_err::read_to_string(&launcher).unwrap();
        assert!(launcher_text.starts_with("#!/usr/bin/python3\n"));
        assert!(launcher_text.contains("from demo import main"));
        let record = Record::from_path(&installed.dist_info.join("RECORD")).unwrap();
        assert!(record.iter().any(|entry| entry.path.contains("../../../bin/demo")
            || entry.path.ends_with("bin/demo")));
    }

    #[test]
    fn corrupted_content_is_rejected() {
        let scratch = tempfile::tempdir().unwrap();
        let wheel_path = make_test_wheel(scratch.path(), "demo", "1.0", None);

        // Tamper: rebuild the wheel with a mismatching RECORD hash.
        let file = fs_err::File::open(&wheel_path).unwrap();
        let mut archive = ZipArchive::new(file.into_parts().0).unwrap();
        let rebuilt = scratch.path().join("tampered-1.0-py3-none-any.whl");
        let mut writer =
            zip::ZipWriter::new(fs_err::File::create(&rebuilt).unwrap().into_parts().0);
        for index in 0..archive.len() {
            let mut entry = archive.by_index(index).unwrap();
            let name = entry.name().to_string();
            let mut content = Vec::new();
            entry.read_to_end(&mut content).unwrap();
            if name.ends_with("__init__.py") {
                content = b"tampered = True\n".to_vec();
            }
            let name = name.replace("demo", "tampered");
            writer.start_file(name, FileOptions::default()).unwrap();
            let content = String::from_utf8_lossy(&content).replace("demo", "tampered");
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap();

        let dest = tempfile::tempdir().unwrap();
        let error = install_wheel(
            &rebuilt,
            &wheel_name("tampered", "1.0"),
            dest.path(),
            &InstallPaths::for_venv(3, 11, false),
            Path::new("/usr/bin/python3"),
            &InstallOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(error, InstallError::RecordMismatch(_)), "{error}");
    }

    #[test]
    fn files_not_in_record_are_rejected() {
        let scratch = tempfile::tempdir().unwrap();
        let path = scratch.path().join("evil-1.0-py3-none-any.whl");
        let mut writer =
            zip::ZipWriter::new(fs_err::File::create(&path).unwrap().into_parts().0);
        let options: FileOptions = FileOptions::default();
        writer
            .start_file("evil-1.0.dist-info/WHEEL", options)
            .unwrap();
        writer
            .write_all(b"Wheel-Version: 1.0\nRoot-Is-Purelib: true\n")
            .unwrap();
        writer
            .start_file("evil-1.0.dist-info/RECORD", options)
            .unwrap();
        writer.write_all(b"evil-1.0.dist-info/RECORD,,\n").unwrap();
        writer.start_file("evil/surprise.py", options).unwrap();
        writer.write_all(b"x = 1\n").unwrap();
        writer.finish().unwrap();

        let dest = tempfile::tempdir().unwrap();
        let error = install_wheel(
            &path,
            &wheel_name("evil", "1.0"),
            dest.path(),
            &InstallPaths::for_venv(3, 11, false),
            Path::new("/usr/bin/python3"),
            &InstallOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(error, InstallError::RecordMismatch(_)), "{error}");
    }
}
