/// True when local mock servers cannot run here (e.g. a sandbox that denies
/// binding loopback sockets). Tests that need one return early.
pub fn should_skip_local_server() -> bool {
    match std::net::TcpListener::bind(("127.0.0.1", 0)) {
        Ok(_) => false,
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            eprintln!("skipping: binding 127.0.0.1 is not permitted here");
            true
        }
        Err(err) => panic!("failed to bind 127.0.0.1 for a mock server: {err}"),
    }
}
