//! End-to-end session scenarios against a scripted loopback origin.
//!
//! The origin side runs on a helper thread speaking raw HTTP/2 built from
//! the same frame codec, reacting to what the session sends.

use bytes::{Bytes, BytesMut};
use http2::frame::{
    self, ErrorCode, Frame, FrameEncoder, HeadersFrame, PingFrame, SettingsFrame,
};
use http2::hpack::{HeaderField, HpackEncoder};
use proxy::config::Config;
use proxy::downstream::{Downstream, ResponseState};
use proxy::session::{HealthState, SessionState};
use proxy::upstream::Upstream;
use proxy::worker::Worker;

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

// -- upstream recorder --

#[derive(Default)]
struct Events {
    statuses: Vec<u16>,
    body: Vec<u8>,
    body_complete: usize,
    aborts: Vec<u16>,
    resets: Vec<bool>,
}

struct RecordingUpstream(Rc<RefCell<Events>>);

impl Upstream for RecordingUpstream {
    fn on_downstream_header_complete(&mut self, downstream: &mut Downstream) -> io::Result<()> {
        self.0
            .borrow_mut()
            .statuses
            .push(downstream.status().unwrap_or(0));
        Ok(())
    }

    fn on_downstream_body(
        &mut self,
        _downstream: &mut Downstream,
        data: &[u8],
        _last: bool,
    ) -> io::Result<()> {
        self.0.borrow_mut().body.extend_from_slice(data);
        Ok(())
    }

    fn on_downstream_body_complete(&mut self, _downstream: &mut Downstream) -> io::Result<()> {
        self.0.borrow_mut().body_complete += 1;
        Ok(())
    }

    fn on_downstream_read(&mut self, _downstream: &mut Downstream) -> io::Result<()> {
        Ok(())
    }

    fn on_downstream_abort_request(&mut self, _downstream: &mut Downstream, status: u16) {
        self.0.borrow_mut().aborts.push(status);
    }

    fn on_downstream_reset(&mut self, _downstream: &mut Downstream, hard: bool) -> io::Result<()> {
        self.0.borrow_mut().resets.push(hard);
        Ok(())
    }
}

// -- scripted origin plumbing --

/// Everything the origin observed, for post-run assertions.
#[derive(Default)]
struct OriginLog {
    /// (frame type, stream id) in arrival order.
    frames: Vec<(u8, u32)>,
    /// RST_STREAM payloads: (stream id, error code).
    resets: Vec<(u32, u32)>,
    /// GOAWAY error codes.
    goaways: Vec<u32>,
    /// The CONNECT request line, when acting as an HTTP proxy.
    connect_request: Option<String>,
}

type SharedLog = Arc<Mutex<OriginLog>>;

fn spawn_origin(
    script: impl FnOnce(TcpStream, SharedLog) + Send + 'static,
) -> (SocketAddr, SharedLog) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let addr = listener.local_addr().unwrap();
    let log: SharedLog = Arc::default();
    let thread_log = log.clone();
    thread::spawn(move || {
        if let Ok((stream, _)) = listener.accept() {
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            script(stream, thread_log);
        }
    });
    (addr, log)
}

fn read_preface(stream: &mut TcpStream) {
    let mut preface = [0u8; 24];
    stream.read_exact(&mut preface).expect("client preface");
    assert_eq!(&preface, frame::CONNECTION_PREFACE);
}

fn read_frame(stream: &mut TcpStream) -> io::Result<(u8, u8, u32, Vec<u8>)> {
    let mut head = [0u8; 9];
    stream.read_exact(&mut head)?;
    let len = u32::from_be_bytes([0, head[0], head[1], head[2]]) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    let stream_id = u32::from_be_bytes([head[5], head[6], head[7], head[8]]) & 0x7fff_ffff;
    Ok((head[3], head[4], stream_id, payload))
}

fn send_frames(stream: &mut TcpStream, frames: &[Frame]) {
    let encoder = FrameEncoder::new();
    let mut out = BytesMut::new();
    for frame in frames {
        encoder.encode(frame, &mut out);
    }
    stream.write_all(&out).expect("origin write");
}

fn response_headers(
    hpack: &mut HpackEncoder,
    stream_id: u32,
    fields: &[HeaderField],
    end_stream: bool,
) -> Frame {
    let mut block = Vec::new();
    hpack.encode(fields, &mut block);
    Frame::Headers(HeadersFrame {
        stream_id,
        end_stream,
        end_headers: true,
        priority: None,
        fragment: Bytes::from(block),
    })
}

fn data_frame(stream_id: u32, payload: &[u8], end_stream: bool) -> Frame {
    Frame::Data(frame::DataFrame::new(
        stream_id,
        Bytes::copy_from_slice(payload),
        end_stream,
    ))
}

/// Serve the HTTP/2 prelude: read the preface, send our SETTINGS, and
/// return once the client's SETTINGS has been acked.
fn serve_prelude(stream: &mut TcpStream, log: &SharedLog) {
    read_preface(stream);
    send_frames(
        stream,
        &[Frame::Settings(SettingsFrame {
            ack: false,
            settings: vec![],
        })],
    );
    loop {
        let (typ, flags, stream_id, _payload) = read_frame(stream).expect("prelude frame");
        log.lock().unwrap().frames.push((typ, stream_id));
        if typ == 0x4 && flags & 0x1 == 0 {
            send_frames(
                stream,
                &[Frame::Settings(SettingsFrame {
                    ack: true,
                    settings: vec![],
                })],
            );
            return;
        }
    }
}

fn log_frame(log: &SharedLog, typ: u8, stream_id: u32, payload: &[u8]) {
    let mut log = log.lock().unwrap();
    log.frames.push((typ, stream_id));
    if typ == 0x3 && payload.len() == 4 {
        let code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        log.resets.push((stream_id, code));
    }
    if typ == 0x7 && payload.len() >= 8 {
        let code = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        log.goaways.push(code);
    }
}

// -- client plumbing --

fn client_config(origin: SocketAddr, extra: &str) -> Arc<Config> {
    let config: Config = toml::from_str(&format!(
        r#"
        [backend]
        nodes = ["{origin}"]
        {extra}
        "#
    ))
    .unwrap();
    Arc::new(config)
}

fn get_request() -> Vec<HeaderField> {
    vec![
        HeaderField::new(":method", "GET"),
        HeaderField::new(":scheme", "http"),
        HeaderField::new(":path", "/"),
        HeaderField::new(":authority", "origin.test"),
    ]
}

// -- scenarios --

/// S1: plain HTTP/2 session; one request, 200 + "hello" response.
#[test]
fn plain_session_round_trip() {
    let (addr, log) = spawn_origin(|mut stream, log| {
        serve_prelude(&mut stream, &log);
        let mut hpack = HpackEncoder::new();
        loop {
            let Ok((typ, _flags, stream_id, payload)) = read_frame(&mut stream) else {
                return;
            };
            log_frame(&log, typ, stream_id, &payload);
            if typ == 0x1 {
                send_frames(
                    &mut stream,
                    &[
                        response_headers(
                            &mut hpack,
                            stream_id,
                            &[
                                HeaderField::new(":status", "200"),
                                HeaderField::new("content-length", "5"),
                            ],
                            false,
                        ),
                        data_frame(stream_id, b"hello", true),
                    ],
                );
            }
        }
    });

    let mut worker = Worker::new(client_config(addr, "")).unwrap();
    let events = Rc::new(RefCell::new(Events::default()));
    let id = worker
        .session
        .attach_downstream(Box::new(RecordingUpstream(events.clone())));
    worker
        .session
        .submit_request(id, None, get_request(), None)
        .unwrap();

    let done = worker
        .run_until(Duration::from_secs(5), |_| {
            events.borrow().body_complete > 0
        })
        .unwrap();
    assert!(done, "response never completed");

    assert_eq!(worker.session.state(), SessionState::Connected);
    assert_eq!(events.borrow().statuses, vec![200]);
    assert_eq!(events.borrow().body, b"hello");
    assert_eq!(
        worker.session.downstream(id).unwrap().response_state(),
        ResponseState::MsgComplete
    );
    assert_eq!(
        worker.session.downstream(id).unwrap().content_length(),
        Some(5)
    );
    // Stream record removed on close.
    assert_eq!(worker.session.stream_count(), 0);

    // The origin's first observed frame is the client SETTINGS (the
    // preface was consumed before it).
    let log = log.lock().unwrap();
    assert_eq!(log.frames.first(), Some(&(0x4, 0)));
    assert!(log.frames.iter().any(|&(typ, _)| typ == 0x1));
}

/// S2: CONNECT through an HTTP proxy, then HTTP/2 over the tunnel.
#[test]
fn proxy_connect_tunnel() {
    let (proxy_addr, log) = spawn_origin(|mut stream, log| {
        // Read the CONNECT request up to the blank line.
        let mut request = Vec::new();
        let mut byte = [0u8; 1];
        while !request.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).expect("CONNECT request");
            request.push(byte[0]);
        }
        log.lock().unwrap().connect_request =
            Some(String::from_utf8_lossy(&request).into_owned());
        stream
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .unwrap();

        // Now act as the origin over the tunnel.
        serve_prelude(&mut stream, &log);
        let mut hpack = HpackEncoder::new();
        loop {
            let Ok((typ, _flags, stream_id, payload)) = read_frame(&mut stream) else {
                return;
            };
            log_frame(&log, typ, stream_id, &payload);
            if typ == 0x1 {
                send_frames(
                    &mut stream,
                    &[
                        response_headers(
                            &mut hpack,
                            stream_id,
                            &[HeaderField::new(":status", "200")],
                            false,
                        ),
                        data_frame(stream_id, b"tunneled", true),
                    ],
                );
            }
        }
    });

    // The backend address itself is never dialed; everything rides the
    // proxy socket.
    let config = client_config(
        "127.0.0.2:9443".parse().unwrap(),
        &format!(
            r#"
            host = "backend"

            [http_proxy]
            addr = "{proxy_addr}"
            userinfo = "user:pass"
            "#
        ),
    );

    let mut worker = Worker::new(config).unwrap();
    let events = Rc::new(RefCell::new(Events::default()));
    let id = worker
        .session
        .attach_downstream(Box::new(RecordingUpstream(events.clone())));
    worker
        .session
        .submit_request(id, None, get_request(), None)
        .unwrap();

    let done = worker
        .run_until(Duration::from_secs(5), |_| {
            events.borrow().body_complete > 0
        })
        .unwrap();
    assert!(done, "tunneled response never completed");

    assert_eq!(events.borrow().body, b"tunneled");
    assert_eq!(
        worker.session.downstream(id).unwrap().response_state(),
        ResponseState::MsgComplete
    );
    // Unknown content length on a body response: chunked re-framing.
    assert!(worker.session.downstream(id).unwrap().chunked());

    let log = log.lock().unwrap();
    let connect = log.connect_request.as_ref().unwrap();
    assert!(connect.starts_with("CONNECT backend:9443 HTTP/1.1\r\n"));
    assert!(connect.contains("Host: backend\r\n"));
    assert!(connect.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
}

/// S3: the SETTINGS ACK never arrives; the session sends
/// GOAWAY(SETTINGS_TIMEOUT) and disconnects softly.
#[test]
fn settings_timeout_terminates_session() {
    let (addr, log) = spawn_origin(|mut stream, log| {
        read_preface(&mut stream);
        // Send our SETTINGS but never ACK the client's.
        send_frames(
            &mut stream,
            &[Frame::Settings(SettingsFrame {
                ack: false,
                settings: vec![],
            })],
        );
        loop {
            let Ok((typ, _flags, stream_id, payload)) = read_frame(&mut stream) else {
                return;
            };
            log_frame(&log, typ, stream_id, &payload);
        }
    });

    let config = client_config(
        addr,
        r#"
        [backend.http2]
        settings_timeout_ms = 200
        "#,
    );
    let mut worker = Worker::new(config).unwrap();
    let events = Rc::new(RefCell::new(Events::default()));
    let _id = worker
        .session
        .attach_downstream(Box::new(RecordingUpstream(events.clone())));
    worker
        .session
        .submit_request(_id, None, get_request(), None)
        .unwrap();

    let done = worker
        .run_until(Duration::from_secs(5), |_| {
            !events.borrow().resets.is_empty()
        })
        .unwrap();
    assert!(done, "session never tore down");

    // Soft failure: the session had reached CONNECTED.
    assert_eq!(events.borrow().resets, vec![false]);
    assert_eq!(worker.session.state(), SessionState::Disconnected);
    assert_eq!(worker.session.downstream_count(), 0);
    assert_eq!(worker.session.stream_count(), 0);

    // Give the origin a moment to observe the GOAWAY.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        if log
            .lock()
            .unwrap()
            .goaways
            .contains(&ErrorCode::SettingsTimeout.to_wire())
        {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "origin never saw GOAWAY(SETTINGS_TIMEOUT)"
        );
        thread::sleep(Duration::from_millis(10));
    }
}

/// S4: duplicate content-length poisons one stream; its sibling on the
/// same session is unaffected.
#[test]
fn bad_response_header_resets_only_that_stream() {
    let (addr, log) = spawn_origin(|mut stream, log| {
        serve_prelude(&mut stream, &log);
        let mut hpack = HpackEncoder::new();
        loop {
            let Ok((typ, _flags, stream_id, payload)) = read_frame(&mut stream) else {
                return;
            };
            log_frame(&log, typ, stream_id, &payload);
            if typ != 0x1 {
                continue;
            }
            if stream_id == 1 {
                // Duplicate content-length: protocol violation.
                send_frames(
                    &mut stream,
                    &[response_headers(
                        &mut hpack,
                        stream_id,
                        &[
                            HeaderField::new(":status", "200"),
                            HeaderField::new("content-length", "5"),
                            HeaderField::new("content-length", "7"),
                        ],
                        false,
                    )],
                );
            } else {
                send_frames(
                    &mut stream,
                    &[
                        response_headers(
                            &mut hpack,
                            stream_id,
                            &[
                                HeaderField::new(":status", "200"),
                                HeaderField::new("content-length", "2"),
                            ],
                            false,
                        ),
                        data_frame(stream_id, b"ok", true),
                    ],
                );
            }
        }
    });

    let mut worker = Worker::new(client_config(addr, "")).unwrap();
    let bad_events = Rc::new(RefCell::new(Events::default()));
    let good_events = Rc::new(RefCell::new(Events::default()));
    let bad = worker
        .session
        .attach_downstream(Box::new(RecordingUpstream(bad_events.clone())));
    let good = worker
        .session
        .attach_downstream(Box::new(RecordingUpstream(good_events.clone())));
    worker
        .session
        .submit_request(bad, None, get_request(), None)
        .unwrap();
    worker
        .session
        .submit_request(good, None, get_request(), None)
        .unwrap();

    let done = worker
        .run_until(Duration::from_secs(5), |session| {
            good_events.borrow().body_complete > 0
                && session
                    .downstream(bad)
                    .is_some_and(|d| d.response_state() == ResponseState::MsgBadHeader)
        })
        .unwrap();
    assert!(done, "scenario did not converge");

    // The poisoned stream never delivered headers or body upstream.
    assert!(bad_events.borrow().statuses.is_empty());
    assert!(bad_events.borrow().body.is_empty());
    assert_eq!(good_events.borrow().body, b"ok");
    assert_eq!(worker.session.state(), SessionState::Connected);

    // The origin saw RST_STREAM(PROTOCOL_ERROR) for stream 1.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        if log
            .lock()
            .unwrap()
            .resets
            .contains(&(1, ErrorCode::ProtocolError.to_wire()))
        {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "origin never saw RST_STREAM(PROTOCOL_ERROR)"
        );
        thread::sleep(Duration::from_millis(10));
    }
}

/// S5: idle session requires a health check; the next request triggers a
/// PING probe, and traffic flushes the queued request.
#[test]
fn health_check_gates_and_flushes_requests() {
    let (addr, _log) = spawn_origin(|mut stream, log| {
        serve_prelude(&mut stream, &log);
        let mut hpack = HpackEncoder::new();
        loop {
            let Ok((typ, _flags, stream_id, payload)) = read_frame(&mut stream) else {
                return;
            };
            log_frame(&log, typ, stream_id, &payload);
            match typ {
                // PING: answer with an ACK.
                0x6 => {
                    let mut opaque = [0u8; 8];
                    opaque.copy_from_slice(&payload);
                    send_frames(&mut stream, &[Frame::Ping(PingFrame { ack: true, opaque })]);
                }
                0x1 => {
                    send_frames(
                        &mut stream,
                        &[response_headers(
                            &mut hpack,
                            stream_id,
                            &[HeaderField::new(":status", "204")],
                            true,
                        )],
                    );
                }
                _ => {}
            }
        }
    });

    let config = client_config(
        addr,
        r#"
        [backend.http2]
        health_check_interval_ms = 150
        "#,
    );
    let mut worker = Worker::new(config).unwrap();
    let first_events = Rc::new(RefCell::new(Events::default()));
    let first = worker
        .session
        .attach_downstream(Box::new(RecordingUpstream(first_events.clone())));
    worker
        .session
        .submit_request(first, None, get_request(), None)
        .unwrap();

    // First exchange completes.
    let done = worker
        .run_until(Duration::from_secs(5), |_| {
            first_events.borrow().statuses.contains(&204)
        })
        .unwrap();
    assert!(done);

    // Idle past the health interval: a check becomes required.
    let done = worker
        .run_until(Duration::from_secs(5), |session| {
            session.health() == HealthState::Required
        })
        .unwrap();
    assert!(done, "health never became REQUIRED");
    assert!(!worker.session.can_push_request());

    // The next submission cannot push; it starts the PING probe.
    let second_events = Rc::new(RefCell::new(Events::default()));
    let second = worker
        .session
        .attach_downstream(Box::new(RecordingUpstream(second_events.clone())));
    worker
        .session
        .submit_request(second, None, get_request(), None)
        .unwrap();
    assert_eq!(worker.session.health(), HealthState::Started);
    assert_eq!(worker.session.stream_count(), 0, "request must stay queued");

    // The PING ACK revives the session and flushes the queued request.
    let done = worker
        .run_until(Duration::from_secs(5), |_| {
            second_events.borrow().statuses.contains(&204)
        })
        .unwrap();
    assert!(done, "queued request never flushed");
    assert_eq!(worker.session.health(), HealthState::None);
    assert!(worker.session.can_push_request());
}

/// A `:method CONNECT` request over the backend session: the origin's
/// 2xx upgrades the stream to a byte tunnel, DATA on it is delivered
/// upstream (not reset), and stream close finalizes the tunneled body.
#[test]
fn connect_upgrade_tunnels_data() {
    let (addr, log) = spawn_origin(|mut stream, log| {
        serve_prelude(&mut stream, &log);
        let mut hpack = HpackEncoder::new();
        loop {
            let Ok((typ, _flags, stream_id, payload)) = read_frame(&mut stream) else {
                return;
            };
            log_frame(&log, typ, stream_id, &payload);
            if typ == 0x1 {
                // Accept the tunnel, stream some bytes through it, then
                // close the stream the way origins end tunnels.
                send_frames(
                    &mut stream,
                    &[
                        response_headers(
                            &mut hpack,
                            stream_id,
                            &[HeaderField::new(":status", "200")],
                            false,
                        ),
                        data_frame(stream_id, b"tunnel-bytes", false),
                        Frame::RstStream(frame::RstStreamFrame {
                            stream_id,
                            error_code: ErrorCode::NoError,
                        }),
                    ],
                );
            }
        }
    });

    let mut worker = Worker::new(client_config(addr, "")).unwrap();
    let events = Rc::new(RefCell::new(Events::default()));
    let id = worker
        .session
        .attach_downstream(Box::new(RecordingUpstream(events.clone())));
    worker
        .session
        .submit_request(
            id,
            None,
            vec![
                HeaderField::new(":method", "CONNECT"),
                HeaderField::new(":authority", "origin.test:443"),
            ],
            None,
        )
        .unwrap();

    let done = worker
        .run_until(Duration::from_secs(5), |_| {
            events.borrow().body_complete > 0
        })
        .unwrap();
    assert!(done, "tunnel body never finalized");

    // The tunnel payload reached the upstream instead of resetting the
    // stream, and the close finalized the body.
    assert_eq!(events.borrow().statuses, vec![200]);
    assert_eq!(events.borrow().body, b"tunnel-bytes");
    assert_eq!(events.borrow().body_complete, 1);

    let downstream = worker.session.downstream(id).unwrap();
    assert!(downstream.upgraded());
    assert_eq!(downstream.response_state(), ResponseState::MsgComplete);
    assert_eq!(downstream.peer_reset_code(), Some(ErrorCode::NoError));
    assert_eq!(worker.session.stream_count(), 0);

    // Idle a little, then confirm the session never reset the tunnel.
    worker.run_until(Duration::from_millis(200), |_| false).unwrap();
    assert!(
        log.lock().unwrap().resets.is_empty(),
        "session must not RST the upgraded stream"
    );
}

/// S6: a PUSH_PROMISE is refused with RST_STREAM(REFUSED_STREAM) on the
/// promised id; the original stream is unaffected.
#[test]
fn push_promise_is_refused() {
    let (addr, log) = spawn_origin(|mut stream, log| {
        serve_prelude(&mut stream, &log);
        let mut hpack = HpackEncoder::new();
        loop {
            let Ok((typ, _flags, stream_id, payload)) = read_frame(&mut stream) else {
                return;
            };
            log_frame(&log, typ, stream_id, &payload);
            if typ == 0x1 {
                // Promise stream 4, then answer the request normally.
                let mut block = Vec::new();
                hpack.encode(&[HeaderField::new(":path", "/pushed")], &mut block);
                send_frames(
                    &mut stream,
                    &[
                        Frame::PushPromise(frame::PushPromiseFrame {
                            stream_id,
                            promised_stream_id: 4,
                            end_headers: true,
                            fragment: Bytes::from(block),
                        }),
                        response_headers(
                            &mut hpack,
                            stream_id,
                            &[
                                HeaderField::new(":status", "200"),
                                HeaderField::new("content-length", "4"),
                            ],
                            false,
                        ),
                        data_frame(stream_id, b"main", true),
                    ],
                );
            }
        }
    });

    let mut worker = Worker::new(client_config(addr, "")).unwrap();
    let events = Rc::new(RefCell::new(Events::default()));
    let id = worker
        .session
        .attach_downstream(Box::new(RecordingUpstream(events.clone())));
    worker
        .session
        .submit_request(id, None, get_request(), None)
        .unwrap();

    let done = worker
        .run_until(Duration::from_secs(5), |_| {
            events.borrow().body_complete > 0
        })
        .unwrap();
    assert!(done, "main response never completed");

    assert_eq!(events.borrow().body, b"main");
    assert_eq!(
        worker.session.downstream(id).unwrap().response_state(),
        ResponseState::MsgComplete
    );

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        if log
            .lock()
            .unwrap()
            .resets
            .contains(&(4, ErrorCode::RefusedStream.to_wire()))
        {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "origin never saw RST_STREAM(REFUSED_STREAM) for the promised id"
        );
        thread::sleep(Duration::from_millis(10));
    }
}
