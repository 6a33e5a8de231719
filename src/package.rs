use crate::error::{DfuError, Result};
use serde::Deserialize;
use std::cell::RefCell;
use std::io::{Cursor, Read};

/// One entry in `manifest.json`'s `manifest` object: the init (`.dat`) and
/// firmware (`.bin`) file names for a given component.
#[derive(Debug, Clone, Deserialize)]
pub struct ComponentEntry {
    pub dat_file: String,
    pub bin_file: String,
}

/// Deep-copyable view of `manifest.json`'s `manifest` object. Any field
/// the package does not carry is simply absent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    pub application: Option<ComponentEntry>,
    pub softdevice: Option<ComponentEntry>,
    pub bootloader: Option<ComponentEntry>,
    pub softdevice_bootloader: Option<ComponentEntry>,
}

#[derive(Debug, Deserialize)]
struct OuterManifest {
    manifest: Manifest,
}

/// The manifest key identifying which image component to load. `Application`
/// is independent of the base-image triple; at most one of the other three
/// may be present in a given package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    Application,
    Softdevice,
    Bootloader,
    SoftdeviceBootloader,
}

impl ComponentKind {
    fn name(self) -> &'static str {
        match self {
            ComponentKind::Application => "application",
            ComponentKind::Softdevice => "softdevice",
            ComponentKind::Bootloader => "bootloader",
            ComponentKind::SoftdeviceBootloader => "softdevice_bootloader",
        }
    }

    fn entry(self, manifest: &Manifest) -> Option<&ComponentEntry> {
        match self {
            ComponentKind::Application => manifest.application.as_ref(),
            ComponentKind::Softdevice => manifest.softdevice.as_ref(),
            ComponentKind::Bootloader => manifest.bootloader.as_ref(),
            ComponentKind::SoftdeviceBootloader => manifest.softdevice_bootloader.as_ref(),
        }
    }
}

/// A firmware update package read from a ZIP archive. Immutable after
/// [`FirmwarePackage::open`]; image bytes are decompressed on demand.
pub struct FirmwarePackage {
    manifest: Manifest,
    archive: RefCell<zip::ZipArchive<Cursor<Vec<u8>>>>,
}

impl FirmwarePackage {
    /// Read `manifest.json` from the archive root and parse its `manifest`
    /// sub-object. Fails with [`DfuError::MalformedPackage`] if the file is
    /// absent, not valid JSON, or lacks the `manifest` key.
    pub fn open(bytes: Vec<u8>) -> Result<Self> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;

        let mut manifest_raw = archive
            .by_name("manifest.json")
            .map_err(|_| DfuError::MalformedPackage("missing manifest.json".to_string()))?;
        let mut contents = String::new();
        manifest_raw.read_to_string(&mut contents)?;
        drop(manifest_raw);

        let outer: OuterManifest = serde_json::from_str(&contents)
            .map_err(|e| DfuError::MalformedPackage(format!("invalid manifest.json: {e}")))?;

        Ok(Self { manifest: outer.manifest, archive: RefCell::new(archive) })
    }

    /// Convenience wrapper over [`FirmwarePackage::open`] for a path on disk.
    pub fn open_path(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::open(bytes)
    }

    /// A deep copy of the parsed manifest; mutating the returned value has
    /// no effect on subsequent [`FirmwarePackage::get_image`] calls.
    pub fn manifest(&self) -> Manifest {
        self.manifest.clone()
    }

    /// The first of {softdevice, bootloader, softdevice_bootloader} present
    /// in the manifest, or `None`.
    pub fn base_image(&self) -> Option<ComponentKind> {
        [
            ComponentKind::Softdevice,
            ComponentKind::Bootloader,
            ComponentKind::SoftdeviceBootloader,
        ]
        .into_iter()
        .find(|kind| kind.entry(&self.manifest).is_some())
    }

    /// The `application` component, or `None`.
    pub fn app_image(&self) -> Option<ComponentKind> {
        ComponentKind::Application.entry(&self.manifest).map(|_| ComponentKind::Application)
    }

    /// Load the `.dat` (init) and `.bin` (firmware image) files for `kind`,
    /// in that order. Fails with [`DfuError::MalformedPackage`] if the
    /// manifest does not name `kind`, or if a named file is missing from
    /// the archive.
    pub fn get_image(&self, kind: ComponentKind) -> Result<(Vec<u8>, Vec<u8>)> {
        let entry = kind
            .entry(&self.manifest)
            .ok_or_else(|| DfuError::MalformedPackage(format!("manifest has no `{}` component", kind.name())))?;

        let dat = self.read_entry(&entry.dat_file)?;
        let bin = self.read_entry(&entry.bin_file)?;
        Ok((dat, bin))
    }

    fn read_entry(&self, name: &str) -> Result<Vec<u8>> {
        let mut archive = self.archive.borrow_mut();
        let mut reader = archive
            .by_name(name)
            .map_err(|_| DfuError::MalformedPackage(format!("archive member `{name}` referenced by manifest is missing")))?;
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn build_package(manifest_json: &str, files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(Cursor::new(&mut buf));
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("manifest.json", options).unwrap();
            writer.write_all(manifest_json.as_bytes()).unwrap();
            for (name, contents) in files {
                writer.start_file(*name, options).unwrap();
                writer.write_all(contents).unwrap();
            }
            writer.finish().unwrap();
        }
        buf
    }

    #[test]
    fn reads_application_component() {
        let manifest = r#"{"manifest":{"application":{"dat_file":"app.dat","bin_file":"app.bin"}}}"#;
        let bytes = build_package(manifest, &[("app.dat", b"INIT"), ("app.bin", b"FIRMWARE")]);

        let pkg = FirmwarePackage::open(bytes).unwrap();
        assert_eq!(pkg.app_image(), Some(ComponentKind::Application));
        assert_eq!(pkg.base_image(), None);

        let (dat, bin) = pkg.get_image(ComponentKind::Application).unwrap();
        assert_eq!(dat, b"INIT");
        assert_eq!(bin, b"FIRMWARE");
    }

    #[test]
    fn prefers_softdevice_bootloader_ordering() {
        let manifest = r#"{"manifest":{
            "bootloader":{"dat_file":"bl.dat","bin_file":"bl.bin"},
            "softdevice_bootloader":{"dat_file":"sdbl.dat","bin_file":"sdbl.bin"}
        }}"#;
        let bytes = build_package(
            manifest,
            &[("bl.dat", b"a"), ("bl.bin", b"b"), ("sdbl.dat", b"c"), ("sdbl.bin", b"d")],
        );
        let pkg = FirmwarePackage::open(bytes).unwrap();
        assert_eq!(pkg.base_image(), Some(ComponentKind::Bootloader));
    }

    #[test]
    fn missing_manifest_is_malformed() {
        let bytes = build_package_without_manifest();
        let err = FirmwarePackage::open(bytes).unwrap_err();
        assert!(matches!(err, DfuError::MalformedPackage(_)));
    }

    fn build_package_without_manifest() -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(Cursor::new(&mut buf));
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("readme.txt", options).unwrap();
            writer.write_all(b"no manifest here").unwrap();
            writer.finish().unwrap();
        }
        buf
    }

    #[test]
    fn manifest_view_is_a_deep_copy() {
        let manifest = r#"{"manifest":{"application":{"dat_file":"app.dat","bin_file":"app.bin"}}}"#;
        let bytes = build_package(manifest, &[("app.dat", b"INIT"), ("app.bin", b"FIRMWARE")]);
        let pkg = FirmwarePackage::open(bytes).unwrap();

        let mut view = pkg.manifest();
        view.application = None;

        assert!(pkg.manifest().application.is_some());
        let (dat, bin) = pkg.get_image(ComponentKind::Application).unwrap();
        assert_eq!(dat, b"INIT");
        assert_eq!(bin, b"FIRMWARE");
    }

    #[test]
    fn open_path_reads_a_package_from_disk() {
        let manifest = r#"{"manifest":{"application":{"dat_file":"app.dat","bin_file":"app.bin"}}}"#;
        let bytes = build_package(manifest, &[("app.dat", b"INIT"), ("app.bin", b"FIRMWARE")]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("update.zip");
        std::fs::write(&path, &bytes).unwrap();

        let pkg = FirmwarePackage::open_path(&path).unwrap();
        let (dat, bin) = pkg.get_image(ComponentKind::Application).unwrap();
        assert_eq!(dat, b"INIT");
        assert_eq!(bin, b"FIRMWARE");
    }
}
