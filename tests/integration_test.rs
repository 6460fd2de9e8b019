use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use texecom::client::Client;
use texecom::constant;
use texecom::frame::{self, FrameKind};
use texecom::tcp;

#[test]
fn test_connect_refused() {
    // nothing listens on the discard port; the connect attempt must fail
    // cleanly rather than hang
    let mut opts = tcp::Options::new("127.0.0.1", 1);
    opts.connection_timeout = Some(Duration::from_secs(1));
    let mut client = Client::new(tcp::Connector::new(opts), "1234");
    assert!(client.connect().is_err());
}

#[test]
fn test_login_against_mock_panel() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let panel = thread::spawn(move || {
        let (mut socket, _) = listener.accept().unwrap();
        let mut buf = [0u8; 64];
        let n = socket.read(&mut buf).unwrap();
        let request = &buf[..n];
        // 't' | 'C' | LEN | SEQ | cmd | password | CRC
        assert_eq!(request[0], b't');
        assert_eq!(request[1], b'C');
        assert_eq!(request[2] as usize, request.len());
        assert_eq!(request[4], constant::CMD_LOGIN);
        assert_eq!(&request[5..n - 1], b"1234");

        let response = frame::encode(
            FrameKind::Response,
            request[3],
            &[constant::CMD_LOGIN, constant::CMD_RESPONSE_ACK],
        );
        socket.write_all(&response).unwrap();
    });

    let mut opts = tcp::Options::new("127.0.0.1", addr.port());
    opts.connect_pause = Duration::from_millis(0);
    let mut client = Client::new(tcp::Connector::new(opts), "1234");
    client.connect().unwrap();
    client.login().unwrap();
    panel.join().unwrap();
}
