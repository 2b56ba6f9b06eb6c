use fusenode::{Config, Filesystem, Session};
use std::rc::Rc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

#[test]
#[cfg(target_os = "linux")]
fn unmount_no_send() {
    // Rc makes this !Send, so it can't be handed to spawn_mount2/BackgroundSession (which
    // require Send + Sync + 'static); it has to run on the thread that created the session.
    struct NoSendFS(Rc<()>);

    impl Filesystem for NoSendFS {}

    let tmpdir: TempDir = tempfile::tempdir().unwrap();
    let mountpoint = tmpdir.path().to_path_buf();
    let session = Session::new(NoSendFS(Rc::new(())), &mountpoint, &Config::default()).unwrap();

    let unmount_point = mountpoint.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_secs(1));
        nix::mount::umount2(&unmount_point, nix::mount::MntFlags::MNT_DETACH)
            .expect("external unmount");
    });

    session.run().unwrap();
}
