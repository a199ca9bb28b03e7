//! Platform adapters for the persistent attribute store, selected at
//! compile time. Unix uses extended attributes in the `user.` namespace;
//! Windows uses NTFS alternate data streams. Callers go through
//! [`super::AttributeCache`], never through these functions directly.

use std::io;
use std::path::Path;

#[cfg(unix)]
pub(super) fn read_attr(path: &Path, attr: &str) -> io::Result<Option<String>> {
    let name = format!("user.{attr}");
    match xattr::get(path, &name)? {
        Some(bytes) => match String::from_utf8(bytes) {
            Ok(value) => Ok(Some(value)),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("attribute '{name}' is not valid UTF-8"),
            )),
        },
        None => Ok(None),
    }
}

#[cfg(unix)]
pub(super) fn write_attr(path: &Path, attr: &str, value: &str) -> io::Result<()> {
    let name = format!("user.{attr}");
    xattr::set(path, &name, value.as_bytes())
}

#[cfg(unix)]
pub(super) fn remove_attr(path: &Path, attr: &str) -> io::Result<()> {
    let name = format!("user.{attr}");
    match xattr::remove(path, &name) {
        Ok(()) => Ok(()),
        // Removing an attribute that was never set is not an error.
        Err(e) if e.raw_os_error() == Some(61) || e.raw_os_error() == Some(93) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(windows)]
fn stream_path(path: &Path, attr: &str) -> std::path::PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(format!(":casbak.{attr}"));
    std::path::PathBuf::from(os)
}

#[cfg(windows)]
pub(super) fn read_attr(path: &Path, attr: &str) -> io::Result<Option<String>> {
    match std::fs::read_to_string(stream_path(path, attr)) {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(windows)]
pub(super) fn write_attr(path: &Path, attr: &str, value: &str) -> io::Result<()> {
    std::fs::write(stream_path(path, attr), value.as_bytes())
}

#[cfg(windows)]
pub(super) fn remove_attr(path: &Path, attr: &str) -> io::Result<()> {
    match std::fs::remove_file(stream_path(path, attr)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(not(any(unix, windows)))]
pub(super) fn read_attr(_path: &Path, _attr: &str) -> io::Result<Option<String>> {
    Ok(None)
}

#[cfg(not(any(unix, windows)))]
pub(super) fn write_attr(_path: &Path, _attr: &str, _value: &str) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "no persistent attribute store on this platform",
    ))
}

#[cfg(not(any(unix, windows)))]
pub(super) fn remove_attr(_path: &Path, _attr: &str) -> io::Result<()> {
    Ok(())
}
