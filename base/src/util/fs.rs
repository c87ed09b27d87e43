use std::fs::{read, read_to_string, File};
use std::path::Path;

use crate::defs::{IntoResult, Result};

fn describe(action: &str, path: &Path) -> String {
    if let Some(path) = path.to_str() {
        format!("failed to {} file '{}'", action, path)
    } else {
        format!("failed to {} file", action)
    }
}

pub fn open_file<P: AsRef<Path>>(path: P) -> Result<File> {
    let path = path.as_ref();
    File::open(path).res(|| describe("open", path))
}

pub fn create_file<P: AsRef<Path>>(path: P) -> Result<File> {
    let path = path.as_ref();
    File::create(path).res(|| describe("create", path))
}

pub fn read_file<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let path = path.as_ref();
    read(path).res(|| describe("read", path))
}

pub fn read_file_to_string<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();
    read_to_string(path).res(|| describe("read", path))
}
