use fusenode::{
    Errno, FileAttr, FileHandle, FileType, Filesystem, INodeNo, KernelConfig, ReplyAttr,
    ReplyDirectory, Request,
};
use std::io;
use std::time::{Duration, UNIX_EPOCH};

const TTL: Duration = Duration::from_secs(1); // 1 second

const HELLO_DIR_ATTR: FileAttr = FileAttr {
    ino: INodeNo::ROOT,
    size: 0,
    blocks: 0,
    atime: UNIX_EPOCH, // 1970-01-01 00:00:00
    mtime: UNIX_EPOCH,
    ctime: UNIX_EPOCH,
    crtime: UNIX_EPOCH,
    kind: FileType::Directory,
    perm: 0o755,
    nlink: 2,
    uid: 501,
    gid: 20,
    rdev: 0,
    flags: 0,
    blksize: 512,
};

const HELLO_TXT_CONTENT: &str = "Hello World!\n";

const HELLO_TXT_ATTR: FileAttr = FileAttr {
    ino: INodeNo(2),
    size: 13,
    blocks: 1,
    atime: UNIX_EPOCH, // 1970-01-01 00:00:00
    mtime: UNIX_EPOCH,
    ctime: UNIX_EPOCH,
    crtime: UNIX_EPOCH,
    kind: FileType::RegularFile,
    perm: 0o644,
    nlink: 1,
    uid: 501,
    gid: 20,
    rdev: 0,
    flags: 0,
    blksize: 512,
};

struct SlowInitFS;

impl Filesystem for SlowInitFS {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> io::Result<()> {
        std::thread::sleep(Duration::new(2, 0));
        Ok(())
    }

    fn getattr(&self, _req: &Request, ino: INodeNo, _fh: Option<FileHandle>, reply: ReplyAttr) {
        match ino {
            INodeNo::ROOT => reply.attr(&TTL, &HELLO_DIR_ATTR),
            INodeNo(2) => reply.attr(&TTL, &HELLO_TXT_ATTR),
            _ => reply.error(Errno::ENOENT),
        }
    }

    fn readdir(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        size: u32,
        reply: ReplyDirectory,
    ) {
        if ino != INodeNo::ROOT {
            reply.error(Errno::ENOENT);
            return;
        }

        let entries: Vec<fusenode::Dirent<'static>> = vec![
            (INodeNo::ROOT, FileType::Directory, "."),
            (INodeNo::ROOT, FileType::Directory, ".."),
            (INodeNo(2), FileType::RegularFile, "hello.txt"),
        ]
        .into_iter()
        .enumerate()
        .map(|(i, (ino, kind, name))| fusenode::Dirent {
            ino,
            offset: (i + 1) as i64,
            kind,
            name: std::ffi::OsString::from(name).into(),
        })
        .collect();

        reply.dir(&entries.into(), size as usize, offset as i64);
    }
}

fn main() {}

#[cfg(test)]
mod tests {
    use super::SlowInitFS;
    use fusenode::Config;
    use fusenode::MountOption;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test2() {
        let mountpoint = tempdir().unwrap().into_path();
        let start = std::time::SystemTime::now();
        let mut config = Config::default();
        config.mount_options.push(MountOption::AutoUnmount);
        let mount = fusenode::spawn_mount2(SlowInitFS, &mountpoint, &config).unwrap();
        std::thread::sleep(Duration::new(0, 100_000));
        // Check that init hasn't finished
        assert!(start.elapsed().unwrap().as_secs_f64() < 0.5);
        let mut entries = std::fs::read_dir(mountpoint).unwrap();
        assert!(entries.find(|x| x.as_ref().unwrap().file_name().eq("hello.txt")).is_some());
        drop(mount);
    }
}
