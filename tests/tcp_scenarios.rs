//! End-to-end scenarios for the TCP active-message transport, run over real
//! loopback sockets (spec section 8: simultaneous connect, pending-queue
//! drain).

use std::cell::RefCell;
use std::net::{SocketAddr, TcpListener};
use std::rc::Rc;
use std::time::{Duration, Instant};

use uct_core::config::TcpConfig;
use uct_core::tcp::TcpIface;

const AM_ID: u8 = 1;

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn run_until<F: FnMut(&mut TcpIface) -> bool>(iface: &mut TcpIface, mut done: F, timeout: Duration) {
    let start = Instant::now();
    loop {
        iface.progress().unwrap();
        if done(iface) {
            return;
        }
        if start.elapsed() > timeout {
            panic!("timed out waiting for condition");
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn connect_and_exchange_one_am() {
    let server_port = free_port();
    let server_addr: SocketAddr = format!("127.0.0.1:{server_port}").parse().unwrap();

    let mut server = TcpIface::bind(server_addr, TcpConfig::default()).unwrap();
    let mut client = TcpIface::bind("127.0.0.1:0".parse().unwrap(), TcpConfig::default()).unwrap();

    let received = Rc::new(RefCell::new(Vec::new()));
    let received_clone = received.clone();
    server.set_am_handler(AM_ID, move |payload| {
        received_clone.borrow_mut().push(payload.to_vec());
    });

    let ep = client.create_endpoint(server_addr).unwrap();

    run_until(
        &mut client,
        |c| c.ep_flush(ep).map(|s| s == uct_core::error::Status::Ok).unwrap_or(false),
        Duration::from_secs(5),
    );

    client.am_short(ep, AM_ID, 0xdead_beef, b"hello").unwrap();

    run_until(
        &mut server,
        |_| !received.borrow().is_empty(),
        Duration::from_secs(5),
    );

    let got = received.borrow();
    assert_eq!(got.len(), 1);
    assert_eq!(&got[0][8..], b"hello");
    assert_eq!(u64::from_le_bytes(got[0][..8].try_into().unwrap()), 0xdead_beef);
}

#[test]
fn pending_queue_drains_once_tx_buffer_empties() {
    let server_port = free_port();
    let server_addr: SocketAddr = format!("127.0.0.1:{server_port}").parse().unwrap();

    let mut server = TcpIface::bind(server_addr, TcpConfig::default()).unwrap();
    let mut client = TcpIface::bind("127.0.0.1:0".parse().unwrap(), TcpConfig::default()).unwrap();

    let received = Rc::new(RefCell::new(Vec::new()));
    let received_clone = received.clone();
    server.set_am_handler(AM_ID, move |payload| {
        received_clone.borrow_mut().push(payload.to_vec());
    });

    let ep = client.create_endpoint(server_addr).unwrap();
    run_until(
        &mut client,
        |c| c.ep_flush(ep).map(|s| s == uct_core::error::Status::Ok).unwrap_or(false),
        Duration::from_secs(5),
    );

    // Stage one AM directly so the TX buffer is occupied, then queue a
    // second explicitly via pending_add; it must not be lost and must
    // arrive after the first.
    client.am_short(ep, AM_ID, 1, b"first").unwrap();
    // NoResource is possible if the first send hasn't flushed synchronously
    // on this run; either way pending_add is the documented path once a
    // send is refused.
    match client.am_short(ep, AM_ID, 2, b"second") {
        Ok(_) => {}
        Err(uct_core::error::Error::NoResource) => {
            client.pending_add(ep, AM_ID, b"second").unwrap();
        }
        Err(e) => panic!("unexpected error: {e}"),
    }

    run_until(
        &mut server,
        |_| received.borrow().len() >= 2,
        Duration::from_secs(5),
    );

    let got = received.borrow();
    assert_eq!(got.len(), 2);
}

#[test]
fn simultaneous_connect_converges_to_one_usable_pair() {
    let a_port = free_port();
    let b_port = free_port();
    let a_addr: SocketAddr = format!("127.0.0.1:{a_port}").parse().unwrap();
    let b_addr: SocketAddr = format!("127.0.0.1:{b_port}").parse().unwrap();

    let mut a = TcpIface::bind(a_addr, TcpConfig::default()).unwrap();
    let mut b = TcpIface::bind(b_addr, TcpConfig::default()).unwrap();

    let a_received = Rc::new(RefCell::new(Vec::new()));
    let b_received = Rc::new(RefCell::new(Vec::new()));
    let a_clone = a_received.clone();
    let b_clone = b_received.clone();
    a.set_am_handler(AM_ID, move |p| a_clone.borrow_mut().push(p.to_vec()));
    b.set_am_handler(AM_ID, move |p| b_clone.borrow_mut().push(p.to_vec()));

    // Both sides initiate toward each other at roughly the same time.
    let ep_ab = a.create_endpoint(b_addr).unwrap();
    let ep_ba = b.create_endpoint(a_addr).unwrap();

    let start = Instant::now();
    loop {
        a.progress().unwrap();
        b.progress().unwrap();
        let a_ok = a.ep_flush(ep_ab).map(|s| s == uct_core::error::Status::Ok).unwrap_or(false);
        let b_ok = b.ep_flush(ep_ba).map(|s| s == uct_core::error::Status::Ok).unwrap_or(false);
        if a_ok && b_ok {
            break;
        }
        if start.elapsed() > Duration::from_secs(5) {
            panic!("simultaneous connect never converged");
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    a.am_short(ep_ab, AM_ID, 0, b"from-a").unwrap();
    b.am_short(ep_ba, AM_ID, 0, b"from-b").unwrap();

    let start = Instant::now();
    loop {
        a.progress().unwrap();
        b.progress().unwrap();
        if !a_received.borrow().is_empty() && !b_received.borrow().is_empty() {
            break;
        }
        if start.elapsed() > Duration::from_secs(5) {
            panic!("messages never arrived after simultaneous connect");
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(&a_received.borrow()[0][8..], b"from-b");
    assert_eq!(&b_received.borrow()[0][8..], b"from-a");
}
