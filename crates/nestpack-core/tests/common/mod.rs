//! Shared fixtures: archives are assembled in memory and written to a
//! temporary directory.

#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nestpack_core::{ContainerLocation, EntryIndex, IndexOptions};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Build an archive. Names ending in `/` become directory entries.
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, bytes) in entries {
        if name.ends_with('/') {
            zip.add_directory(*name, options).unwrap();
        } else {
            zip.start_file(*name, options).unwrap();
            zip.write_all(bytes).unwrap();
        }
    }
    zip.finish().unwrap().into_inner()
}

/// Text of a unit image exporting `procedures` (name, host symbol).
pub fn unit(name: &str, procedures: &[(&str, &str)]) -> Vec<u8> {
    let mut text = format!("name = \"{}\"\n\n[procedures]\n", name);
    for (procedure, symbol) in procedures {
        text.push_str(&format!("{} = \"{}\"\n", procedure, symbol));
    }
    text.into_bytes()
}

/// Archive descriptor with a vendor and optional seal.
pub fn descriptor(vendor: &str, sealed: bool) -> Vec<u8> {
    format!(
        "[namespace]\ntitle = \"{v} library\"\nversion = \"1.0\"\nvendor = \"{v}\"\nsealed = {s}\n",
        v = vendor,
        s = sealed
    )
    .into_bytes()
}

pub fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

/// Write `bytes` as a container and scan it with default options.
pub fn scanned(dir: &Path, bytes: &[u8]) -> Arc<EntryIndex> {
    scanned_with(dir, bytes, IndexOptions::default())
}

pub fn scanned_with(dir: &Path, bytes: &[u8], options: IndexOptions) -> Arc<EntryIndex> {
    let path = write_file(dir, "app.pkg", bytes);
    let index = EntryIndex::new(ContainerLocation::from_path(&path).unwrap(), options);
    index.scan().unwrap();
    Arc::new(index)
}

/// `app.pkg` with an entry unit at the root and `com.acme.Util` inside a
/// nested `lib.pkg` carrying a vendor descriptor.
pub fn app_with_lib() -> Vec<u8> {
    let lib = zip_bytes(&[
        ("META-INF/manifest.toml", &descriptor("Acme Corp", false)),
        ("com/", b""),
        ("com/acme/", b""),
        ("com/acme/Util.mod", &unit("com.acme.Util", &[("main", "test.noop")])),
        ("com/acme/data.txt", b"lib data"),
    ]);
    zip_bytes(&[
        ("META-INF/manifest.toml", b"main = \"app.Main\"\n"),
        ("app/Main.mod", &unit("app.Main", &[("main", "test.noop")])),
        ("app/data.txt", b"root data"),
        ("lib.pkg", &lib),
    ])
}
