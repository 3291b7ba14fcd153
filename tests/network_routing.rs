//! Two-instance network tests: a location-specifier column routes a
//! derived tuple to its peer instead of the originating instance's own
//! table, and an ephemeral-port instance is bindable by a peer.

use std::time::{Duration, Instant};

use c4::Client;

fn wait_until(mut check: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn a_fact_addressed_to_a_peer_arrives_there_and_not_locally() {
    let a = Client::make(0).unwrap();
    let b = Client::make(0).unwrap();
    assert_ne!(a.get_port(), 0);
    assert_ne!(b.get_port(), 0);

    a.install_str("msg(string@, int8);").unwrap();
    b.install_str("msg(string@, int8);").unwrap();

    let b_addr = format!("tcp:127.0.0.1:{}", b.get_port());
    a.install_str(&format!("msg(\"{b_addr}\", 42);")).unwrap();

    // The originating instance never stores a fact addressed elsewhere.
    assert!(a.dump_table("msg").unwrap().is_empty());

    let arrived = wait_until(
        || b.dump_table("msg").unwrap().len() == 1,
        Duration::from_secs(5),
    );
    assert!(arrived, "peer never received the routed tuple");

    let rows = b.dump_table("msg").unwrap();
    assert_eq!(rows[0].get(1).as_i8(), Some(42));

    a.destroy();
    b.destroy();
}

#[test]
fn ephemeral_port_instance_is_bindable_by_a_second_client() {
    let a = Client::make(0).unwrap();
    let port = a.get_port();
    assert_ne!(port, 0);

    let b = Client::make(0).unwrap();
    b.install_str("msg(string@, int8);").unwrap();
    a.install_str("msg(string@, int8);").unwrap();

    let a_addr = format!("tcp:127.0.0.1:{port}");
    b.install_str(&format!("msg(\"{a_addr}\", 7);")).unwrap();

    let arrived = wait_until(
        || a.dump_table("msg").unwrap().len() == 1,
        Duration::from_secs(5),
    );
    assert!(arrived, "ephemeral-port instance never received the peer's tuple");

    a.destroy();
    b.destroy();
}
