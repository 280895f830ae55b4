use std::{thread, time::Duration};

use atbus_network::{PollEvent, StreamChannel, make_address};

#[test]
fn pipe_frame_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("atbus_pipe.sock");
    let addr = make_address(&format!("unix://{}", path.display())).unwrap();

    let mut server = StreamChannel::default();
    let mut client = StreamChannel::default();
    server.listen(&addr).unwrap();
    let client_token = client.connect(&addr).unwrap();

    let mut server_token = None;
    let mut connected = false;
    for _ in 0..2000 {
        server.poll_with(|ev| {
            if let PollEvent::Accepted { stream, .. } = ev {
                server_token = Some(stream);
            }
        });
        client.poll_with(|ev| {
            if let PollEvent::Connected { .. } = ev {
                connected = true;
            }
        });
        if server_token.is_some() && connected {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    let server_token = server_token.expect("pipe accept");
    assert!(connected, "pipe connect");

    let payloads: Vec<Vec<u8>> =
        (0..16u32).map(|i| (0..1 + (i as usize * 53) % 600).map(|j| (j ^ i as usize) as u8).collect()).collect();
    for p in &payloads {
        client.send(client_token, p).unwrap();
    }

    let mut got: Vec<Vec<u8>> = Vec::new();
    for _ in 0..2000 {
        client.poll_with(|_| {});
        server.poll_with(|ev| {
            if let PollEvent::Received { token, payload, err } = ev {
                assert_eq!(token, server_token);
                assert!(err.is_none());
                got.push(payload.to_vec());
            }
        });
        if got.len() == payloads.len() {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(got, payloads);

    server.send(server_token, b"over the pipe").unwrap();
    let mut reply = None;
    for _ in 0..2000 {
        server.poll_with(|_| {});
        client.poll_with(|ev| {
            if let PollEvent::Received { payload, err, .. } = ev {
                assert!(err.is_none());
                reply = Some(payload.to_vec());
            }
        });
        if reply.is_some() {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(reply.unwrap(), b"over the pipe");
}
