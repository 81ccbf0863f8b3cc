//! VFS plumbing (§4/§6): a small operation-table trait any concrete
//! filesystem implements, with RAMFS/TmpFS mounted at boot. The out-of-scope
//! disk filesystem is reached the same way — through this trait — so a real
//! block-backed implementation can be mounted later without touching a
//! syscall handler.

pub mod dentry;
pub mod error;
pub mod fd;
pub mod inode;
pub mod mount;
pub mod pipe;
pub mod ramfs;
pub mod vfs;

use lazy_static::lazy_static;
use vfs::Vfs;

use crate::sync::IrqSpinLock;

lazy_static! {
    pub static ref VFS: IrqSpinLock<Vfs> = IrqSpinLock::new(Vfs::new());
}

/// Initialize the VFS with RAMFS at root and a TmpFS at `/tmp`.
pub fn init() {
    let mut vfs = VFS.lock();

    let ramfs: &'static ramfs::RamFs = &ramfs::RAMFS_INSTANCE;
    vfs.mount("/", ramfs);

    let tmpfs: &'static ramfs::RamFs = &ramfs::TMPFS_INSTANCE;
    vfs.mount("/tmp", tmpfs);

    drop(vfs);
    seed_default_files();

    crate::log_info!("VFS initialized: ramfs at /, tmpfs at /tmp.");
}

fn seed_default_files() {
    let mut vfs = VFS.lock();
    let _ = vfs.mkdir("/bin");
    let _ = vfs.mkdir("/etc");
    let _ = vfs.mkdir("/home");
    let _ = vfs.create("/etc/hostname");
    let _ = vfs.write_file("/etc/hostname", b"coalos\n");
}
