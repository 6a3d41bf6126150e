use egd_core::LockHandle;

#[test]
fn second_acquire_without_force_fails_while_first_is_held() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("egd.lck");

    let _first = LockHandle::acquire(&path, false).expect("first acquire succeeds");
    let err = LockHandle::acquire(&path, false).expect_err("second acquire must fail while pid is alive");
    assert_eq!(err.code, "DAEMON_ALREADY_RUNNING");
}

#[test]
fn force_bypasses_held_lock() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("egd.lck");

    let _first = LockHandle::acquire(&path, false).unwrap();
    let _second = LockHandle::acquire(&path, true).expect("force bypasses the alive check");
}

#[test]
fn lock_file_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("egd.lck");
    let _lock = LockHandle::acquire(&path, false).unwrap();

    let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o600);
}
