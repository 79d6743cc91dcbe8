//! Container fixtures for bootstrap tests.

#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use nestpack_core::resolver::HandlerRegistry;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// Serializes tests that touch the process-wide bootstrap properties.
static BOOTSTRAP_LOCK: Mutex<()> = Mutex::new(());

pub fn serial() -> MutexGuard<'static, ()> {
    BOOTSTRAP_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// A registry private to one test.
pub fn private_registry() -> &'static HandlerRegistry {
    Box::leak(Box::new(HandlerRegistry::new()))
}

pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    for (name, bytes) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(bytes).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

pub fn unit(name: &str, procedures: &[(&str, &str)]) -> Vec<u8> {
    let mut text = format!("name = \"{}\"\n\n[procedures]\n", name);
    for (procedure, symbol) in procedures {
        text.push_str(&format!("{} = \"{}\"\n", procedure, symbol));
    }
    text.into_bytes()
}

/// `app.pkg`: entry `app.Main` exporting `main = <entry_symbol>`, plus
/// `lib.pkg` holding `com.acme.Util` under an "Acme Corp" descriptor.
pub fn scenario(entry_symbol: &str) -> Vec<u8> {
    let lib = zip_bytes(&[
        (
            "META-INF/manifest.toml",
            b"[namespace]\ntitle = \"Acme Utilities\"\nvendor = \"Acme Corp\"\n",
        ),
        ("com/acme/Util.mod", &unit("com.acme.Util", &[("main", "nestpack.echo")])),
    ]);
    zip_bytes(&[
        ("app/Main.mod", &unit("app.Main", &[("main", entry_symbol)])),
        ("lib.pkg", &lib),
    ])
}

pub fn write_container(dir: &Path, bytes: &[u8]) -> PathBuf {
    let path = dir.join("app.pkg");
    std::fs::write(&path, bytes).unwrap();
    path
}

/// Log output written by `tracing` on the current thread.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    pub fn contents(&self) -> String {
        let buf = self.0.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&buf).into_owned()
    }
}

impl Write for CapturedLogs {
    fn write(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Run `f` with a subscriber that records every event at `debug` and above.
pub fn capture_logs<R>(f: impl FnOnce() -> R) -> (R, String) {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let result = tracing::subscriber::with_default(subscriber, f);
    (result, logs.contents())
}
