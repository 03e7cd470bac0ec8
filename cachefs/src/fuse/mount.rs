//! Mount helpers.
//!
//! Linux only; unprivileged mounts go through fusermount3.

use std::path::Path;

use rfuse3::MountOptions;

use crate::fuse::CacheFuse;

fn default_mount_options() -> MountOptions {
    let mut mo = MountOptions::default();
    mo.fs_name("cachefs");
    // SAFETY: getuid/getgid cannot fail.
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    mo.uid(uid).gid(gid);
    mo
}

/// Mount `fs` on the (empty) directory `mount_point`.
#[cfg(target_os = "linux")]
pub async fn mount_unprivileged(
    fs: CacheFuse,
    mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle> {
    let session = rfuse3::raw::Session::new(default_mount_options());
    session.mount_with_unprivileged(fs, mount_point).await
}

#[cfg(not(target_os = "linux"))]
pub async fn mount_unprivileged(
    _fs: CacheFuse,
    _mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}
