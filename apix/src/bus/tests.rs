use std::thread::sleep;
use std::time::Duration;

use apix_proto::{Decoded, Encoder, Leader, Packet, Reply, Status, crc16, read_one_packet};

use super::*;
use crate::mem::{MemHub, MemPeer, MemSink};

struct Harness {
    bus: Bus,
    hub: MemHub,
}

/// A test participant: one in-memory connection plus its own encoder.
struct Peer {
    io: MemPeer,
    enc: Encoder,
}

impl Harness {
    fn new(config: BusConfig) -> Self {
        let sink = MemSink::new();
        let hub = sink.hub();
        let mut bus = Bus::new(config);
        bus.add_sink(sink).unwrap();
        Self { bus, hub }
    }

    fn connect(&mut self) -> Peer {
        let io = self.hub.connect("test");
        self.cycle();
        Peer {
            io,
            enc: Encoder::new(),
        }
    }

    fn cycle(&mut self) {
        self.bus.poll(Duration::ZERO).unwrap();
    }

    /// Registers `header` for `peer` and checks the acknowledgement.
    fn register(&mut self, peer: &mut Peer, header: &str) {
        peer.request(1, SERVICE_ADD, &format!(r#"{{"header":"{header}"}}"#));
        self.cycle();
        let ack = peer.packets();
        assert_eq!(ack.len(), 1);
        assert_eq!(status(&ack[0]), Status::Ok);
    }
}

impl Peer {
    fn handle(&self) -> Handle {
        self.io.handle()
    }

    fn request(&mut self, reqid: u16, header: &str, data: &str) -> Packet {
        let p = self.enc.request(reqid, header, data).unwrap();
        self.io.send(p.as_bytes()).unwrap();
        p
    }

    fn respond(&mut self, to: &Packet, data: &str) -> Packet {
        let p = self
            .enc
            .response(to.reqid(), to.crc16(), to.header(), data)
            .unwrap();
        self.io.send(p.as_bytes()).unwrap();
        p
    }

    fn subscribe(&mut self, topic: &str) -> Packet {
        let p = self.enc.subscribe(topic, "{}").unwrap();
        self.io.send(p.as_bytes()).unwrap();
        p
    }

    fn unsubscribe(&mut self, topic: &str) {
        let p = self.enc.unsubscribe(topic).unwrap();
        self.io.send(p.as_bytes()).unwrap();
    }

    fn publish(&mut self, topic: &str, data: &str) -> Packet {
        let p = self.enc.publish(topic, data).unwrap();
        self.io.send(p.as_bytes()).unwrap();
        p
    }

    /// Everything the bus wrote to this peer, decoded.
    fn packets(&self) -> Vec<Packet> {
        let bytes = self.io.recv();
        let mut rest = &bytes[..];
        let mut out = Vec::new();
        while !rest.is_empty() {
            match read_one_packet(rest) {
                Decoded::Packet(p) => {
                    rest = &rest[p.len()..];
                    out.push(p);
                }
                other => panic!("bus wrote an undecodable frame: {other:?}"),
            }
        }
        out
    }
}

fn status(p: &Packet) -> Status {
    assert_eq!(p.leader(), Leader::Response);
    Reply::parse(p.data()).and_then(|r| r.status()).unwrap()
}

fn fast() -> BusConfig {
    BusConfig {
        request_timeout_ms: 30,
        service_alive_timeout_ms: 60_000,
        parse_grace_ms: 30,
        ..BusConfig::default()
    }
}

#[test]
fn request_reaches_service_and_response_returns() {
    let mut h = Harness::new(BusConfig::default());
    let mut server = h.connect();
    let mut client = h.connect();

    server.request(7, SERVICE_ADD, r#"{"header":"/hello/x"}"#);
    h.cycle();
    let ack = server.packets();
    assert_eq!(ack.len(), 1);
    assert_eq!(ack[0].header(), SERVICE_ADD);
    assert_eq!(ack[0].reqid(), 7);
    assert_eq!(status(&ack[0]), Status::Ok);
    assert_eq!(h.bus.services()[0].header(), "/hello/x");
    assert_eq!(h.bus.services()[0].owner(), server.handle());

    let req = client.request(0x8888, "/hello/x", r#"{"name":"yon","age":18}"#);
    h.cycle();
    let fwd = server.packets();
    assert_eq!(fwd.len(), 1);
    assert_eq!(fwd[0].leader(), Leader::Request);
    assert_eq!(fwd[0].header(), "/hello/x");
    assert_eq!(fwd[0].data(), req.data());
    assert_ne!(fwd[0].reqid(), 0);
    assert_eq!(fwd[0].crc16(), req.crc16());
    assert_eq!(h.bus.pending_requests().len(), 1);
    assert_eq!(h.bus.pending_requests()[0].forward_id(), fwd[0].reqid());
    assert_eq!(
        h.bus.pending_requests()[0].state(),
        RequestState::WaitingResponse
    );

    server.respond(&fwd[0], r#"{"err":0,"errmsg":"succ"}"#);
    h.cycle();
    let back = client.packets();
    assert_eq!(back.len(), 1);
    assert_eq!(back[0].reqid(), 0x8888);
    assert_eq!(back[0].reqcrc16(), req.crc16());
    assert_eq!(back[0].data_str(), Some(r#"{"err":0,"errmsg":"succ"}"#));
    assert!(h.bus.pending_requests().is_empty());
    assert!(server.packets().is_empty());
}

#[test]
fn duplicate_service_is_rejected() {
    let mut h = Harness::new(BusConfig::default());
    let mut a = h.connect();
    let mut b = h.connect();
    h.register(&mut a, "/hello/x");

    b.request(1, SERVICE_ADD, r#"{"header":"/hello/x"}"#);
    h.cycle();
    assert_eq!(status(&b.packets()[0]), Status::DupService);
    assert_eq!(h.bus.services().len(), 1);
    assert_eq!(h.bus.services()[0].owner(), a.handle());
}

#[test]
fn control_requests_validate_their_body() {
    let mut h = Harness::new(BusConfig::default());
    let mut a = h.connect();
    let mut b = h.connect();

    a.request(1, SERVICE_ADD, r#"{"name":"/x"}"#);
    a.request(2, SERVICE_DEL, r#"{"header":"/nope"}"#);
    a.request(3, SERVICE_ALIVE, r#"{"header":"/nope"}"#);
    h.cycle();
    let replies = a.packets();
    assert_eq!(
        replies.iter().map(status).collect::<Vec<_>>(),
        vec![
            Status::Failed,
            Status::ServiceNotFound,
            Status::ServiceNotFound
        ]
    );
    assert_eq!(
        replies.iter().map(Packet::reqid).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    h.register(&mut a, "/mine");
    b.request(4, SERVICE_DEL, r#"{"header":"/mine"}"#);
    h.cycle();
    assert_eq!(status(&b.packets()[0]), Status::Failed);
    assert_eq!(h.bus.services().len(), 1);

    a.request(5, SERVICE_DEL, r#"{"header":"/mine"}"#);
    h.cycle();
    assert_eq!(status(&a.packets()[0]), Status::Ok);
    assert!(h.bus.services().is_empty());
}

#[test]
fn missing_service_replies_to_requester_only() {
    let mut h = Harness::new(BusConfig::default());
    let mut client = h.connect();
    let bystander = h.connect();

    let req = client.request(0x42, "/nobody/home", "{}");
    h.cycle();
    let reply = client.packets();
    assert_eq!(reply.len(), 1);
    assert_eq!(status(&reply[0]), Status::ServiceNotFound);
    assert_eq!(reply[0].reqid(), 0x42);
    assert_eq!(reply[0].reqcrc16(), req.crc16());
    assert_eq!(reply[0].header(), "/nobody/home");
    assert!(bystander.packets().is_empty());
    assert!(h.bus.pending_requests().is_empty());
}

#[test]
fn responses_never_cross_match() {
    let mut h = Harness::new(BusConfig::default());
    let mut sa = h.connect();
    let mut sb = h.connect();
    let mut ca = h.connect();
    let mut cb = h.connect();
    h.register(&mut sa, "/svc/a");
    h.register(&mut sb, "/svc/b");

    ca.request(1, "/svc/a", r#"{"q":"a"}"#);
    cb.request(2, "/svc/b", r#"{"q":"b"}"#);
    h.cycle();
    let fa = sa.packets().remove(0);
    let fb = sb.packets().remove(0);
    assert_eq!(h.bus.pending_requests().len(), 2);

    // Wrong checksum.
    let bogus = sa
        .enc
        .response(fa.reqid(), fa.crc16() ^ 1, "/svc/a", "{}")
        .unwrap();
    sa.io.send(bogus.as_bytes()).unwrap();
    // Right checksum, other caller's id.
    let stolen = sa
        .enc
        .response(fb.reqid(), fa.crc16(), "/svc/a", "{}")
        .unwrap();
    sa.io.send(stolen.as_bytes()).unwrap();
    h.cycle();
    assert!(ca.packets().is_empty());
    assert!(cb.packets().is_empty());
    assert_eq!(h.bus.pending_requests().len(), 2);

    sb.respond(&fb, r#"{"r":"b"}"#);
    h.cycle();
    assert!(ca.packets().is_empty());
    let got = cb.packets();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].reqid(), 2);
    assert_eq!(got[0].data(), br#"{"r":"b"}"#);

    sa.respond(&fa, r#"{"r":"a"}"#);
    h.cycle();
    assert_eq!(ca.packets()[0].data(), br#"{"r":"a"}"#);
    assert!(h.bus.pending_requests().is_empty());
}

#[test]
fn request_timeout_is_reported_once() {
    let mut h = Harness::new(fast());
    let mut server = h.connect();
    let mut client = h.connect();
    h.register(&mut server, "/slow");

    let req = client.request(9, "/slow", "{}");
    h.cycle();
    let fwd = server.packets().remove(0);

    sleep(Duration::from_millis(80));
    h.cycle();
    let reply = client.packets();
    assert_eq!(reply.len(), 1);
    assert_eq!(status(&reply[0]), Status::RequestTimeout);
    assert_eq!(reply[0].reqid(), 9);
    assert_eq!(reply[0].reqcrc16(), req.crc16());
    assert!(h.bus.pending_requests().is_empty());

    // A late answer finds nothing to match.
    server.respond(&fwd, "{}");
    h.cycle();
    h.cycle();
    assert!(client.packets().is_empty());
}

#[test]
fn request_to_vanished_service_times_out() {
    let mut h = Harness::new(fast());
    let mut server = h.connect();
    let mut client = h.connect();
    h.register(&mut server, "/gone");

    client.request(3, "/gone", "{}");
    h.cycle();
    server.io.close();
    h.cycle();
    assert!(h.bus.services().is_empty());
    assert_eq!(h.bus.pending_requests().len(), 1);

    sleep(Duration::from_millis(80));
    h.cycle();
    assert_eq!(status(&client.packets()[0]), Status::RequestTimeout);
}

#[test]
fn publish_fans_out_to_subscribers() {
    let mut h = Harness::new(BusConfig::default());
    let mut subs: Vec<Peer> = (0..3).map(|_| h.connect()).collect();
    let mut publisher = h.connect();

    for s in &mut subs {
        let sub = s.subscribe("/motor/speed");
        h.cycle();
        let ack = s.packets();
        assert_eq!(ack.len(), 1);
        assert_eq!(ack[0].header(), "/motor/speed");
        assert_eq!(ack[0].reqid(), 0);
        assert_eq!(ack[0].reqcrc16(), sub.crc16());
        assert_eq!(status(&ack[0]), Status::Ok);
    }
    assert_eq!(h.bus.topics()[0].subscribers().len(), 3);

    let msg = publisher.publish("/motor/speed", r#"{"speed":12}"#);
    h.cycle();
    for s in &subs {
        let got = s.packets();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].as_bytes(), msg.as_bytes());
    }
    assert!(publisher.packets().is_empty());

    subs[1].unsubscribe("/motor/speed");
    h.cycle();
    assert_eq!(status(&subs[1].packets()[0]), Status::Ok);

    publisher.publish("/motor/speed", r#"{"speed":13}"#);
    h.cycle();
    assert_eq!(subs[0].packets().len(), 1);
    assert!(subs[1].packets().is_empty());
    assert_eq!(subs[2].packets().len(), 1);
}

#[test]
fn publish_without_subscribers_sends_nothing() {
    let mut h = Harness::new(BusConfig::default());
    let mut publisher = h.connect();
    let other = h.connect();

    publisher.publish("/nobody/listens", r#"{"v":1}"#);
    h.cycle();
    assert!(publisher.packets().is_empty());
    assert!(other.packets().is_empty());
    assert!(h.bus.topics().is_empty());
}

#[test]
fn topic_capacity_is_bounded() {
    let mut h = Harness::new(BusConfig {
        max_subscribers: 2,
        ..BusConfig::default()
    });
    let mut peers: Vec<Peer> = (0..3).map(|_| h.connect()).collect();
    for p in &mut peers {
        p.subscribe("/t");
    }
    h.cycle();
    let acks: Vec<Status> = peers.iter().map(|p| status(&p.packets()[0])).collect();
    assert_eq!(
        acks,
        vec![Status::Ok, Status::Ok, Status::TooManySubscribers]
    );
    assert_eq!(h.bus.topics()[0].subscribers().len(), 2);

    // Subscribing twice does not take a second slot.
    peers[0].subscribe("/t");
    h.cycle();
    assert_eq!(status(&peers[0].packets()[0]), Status::Ok);
    assert_eq!(h.bus.topics()[0].subscribers().len(), 2);
}

#[test]
fn empty_topic_disappears() {
    let mut h = Harness::new(BusConfig::default());
    let mut p = h.connect();
    p.subscribe("/t");
    h.cycle();
    assert_eq!(h.bus.topics().len(), 1);
    p.unsubscribe("/t");
    p.unsubscribe("/never");
    h.cycle();
    assert!(h.bus.topics().is_empty());
    assert_eq!(p.packets().len(), 3);
}

#[test]
fn silent_service_expires() {
    let mut h = Harness::new(BusConfig {
        service_alive_timeout_ms: 30,
        ..BusConfig::default()
    });
    let mut server = h.connect();
    h.register(&mut server, "/sleepy");

    sleep(Duration::from_millis(80));
    h.cycle();
    assert!(h.bus.services().is_empty());
    let note = server.packets();
    assert_eq!(note.len(), 1);
    assert_eq!(note[0].header(), "/sleepy");
    assert_eq!(note[0].reqid(), 0);
    assert_eq!(note[0].reqcrc16(), 0);
    assert_eq!(status(&note[0]), Status::ServiceExpired);
}

#[test]
fn alive_keeps_service_registered() {
    let mut h = Harness::new(BusConfig {
        service_alive_timeout_ms: 200,
        ..BusConfig::default()
    });
    let mut server = h.connect();
    h.register(&mut server, "/beat");

    sleep(Duration::from_millis(120));
    server.request(2, SERVICE_ALIVE, r#"{"header":"/beat"}"#);
    h.cycle();
    assert_eq!(status(&server.packets()[0]), Status::Ok);

    sleep(Duration::from_millis(120));
    h.cycle();
    assert_eq!(h.bus.services().len(), 1);
    assert!(server.packets().is_empty());
}

#[test]
fn closed_connection_takes_its_state_along() {
    let mut h = Harness::new(BusConfig::default());
    let mut server = h.connect();
    let mut sub = h.connect();
    let mut client = h.connect();
    h.register(&mut server, "/svc");
    sub.subscribe("/t");
    client.request(1, "/svc", "{}");
    h.cycle();
    assert_eq!(h.bus.pending_requests().len(), 1);

    client.io.close();
    sub.io.close();
    h.cycle();
    assert!(h.bus.pending_requests().is_empty());
    assert!(h.bus.topics().is_empty());
    assert!(h.bus.connection(client.handle()).is_none());

    h.bus.close(server.handle()).unwrap();
    assert!(h.bus.services().is_empty());
    assert!(!server.io.is_open());
    assert!(matches!(
        h.bus.close(server.handle()),
        Err(Error::UnknownHandle(_))
    ));
}

#[test]
fn garbage_before_a_frame_is_skipped() {
    let mut h = Harness::new(BusConfig::default());
    let mut p = h.connect();
    p.io.send(b"line noise >> x").unwrap();
    p.subscribe("/t");
    h.cycle();
    let got = p.packets();
    assert_eq!(got.len(), 1);
    assert_eq!(status(&got[0]), Status::Ok);
    assert!(h.bus.connection(p.handle()).unwrap().rx.is_empty());
}

#[test]
fn stale_partial_frame_is_dropped_after_grace() {
    let mut h = Harness::new(fast());
    let mut p = h.connect();
    let frame = p.enc.subscribe("/t", "{}").unwrap();
    p.io.send(&frame.as_bytes()[..10]).unwrap();
    h.cycle();
    assert_eq!(h.bus.connection(p.handle()).unwrap().rx.used(), 10);

    sleep(Duration::from_millis(80));
    h.cycle();
    assert!(h.bus.connection(p.handle()).unwrap().rx.is_empty());

    p.subscribe("/t");
    h.cycle();
    assert_eq!(p.packets().len(), 1);
}

#[test]
fn split_frame_is_reassembled() {
    let mut h = Harness::new(BusConfig::default());
    let mut p = h.connect();
    let frame = p.enc.subscribe("/t", "{}").unwrap();
    let (head, tail) = frame.as_bytes().split_at(7);
    p.io.send(head).unwrap();
    h.cycle();
    assert!(p.packets().is_empty());
    p.io.send(tail).unwrap();
    h.cycle();
    assert_eq!(p.packets().len(), 1);
}

#[test]
fn sink_management() {
    let mut h = Harness::new(BusConfig::default());
    assert!(matches!(
        h.bus.add_sink(MemSink::new()),
        Err(Error::DuplicateSink(_))
    ));
    assert!(matches!(
        h.bus.open("nope", "x"),
        Err(Error::UnknownSink(_))
    ));

    let handle = h.bus.open("mem", "device").unwrap();
    let dev = h.hub.peer(handle);
    assert_eq!(h.bus.send(handle, b"raw").unwrap(), 3);
    assert!(dev.recv().is_empty());
    h.cycle();
    assert_eq!(dev.recv(), b"raw");

    let sink = h.bus.remove_sink("mem").unwrap();
    assert_eq!(sink.name(), "mem");
    assert!(h.bus.connection(handle).is_none());
    assert!(!dev.is_open());
}

#[test]
fn ioctl_goes_to_owning_sink() {
    let mut h = Harness::new(BusConfig::default());
    let p = h.connect();
    let cmd = Ioctl::Serial(crate::sink::SerialParams::default());
    assert!(matches!(
        h.bus.ioctl(p.handle(), &cmd),
        Err(Error::Unsupported { .. })
    ));
    assert!(matches!(
        h.bus.ioctl(-1, &cmd),
        Err(Error::UnknownHandle(-1))
    ));
}

#[test]
fn idle_backoff_grows_and_resets() {
    let mut h = Harness::new(BusConfig {
        idle_backoff_ms: Some(50),
        ..BusConfig::default()
    });
    let mut p = h.connect();
    h.cycle();
    h.cycle();
    h.cycle();
    assert_eq!(h.bus.idle, Duration::from_millis(20));

    p.subscribe("/t");
    h.cycle();
    assert_eq!(h.bus.idle, Duration::from_millis(5));

    for _ in 0..20 {
        h.cycle();
    }
    assert_eq!(h.bus.idle, Duration::from_millis(50));
}

#[test]
fn identical_requests_keep_their_own_ids() {
    let mut h = Harness::new(BusConfig::default());
    let mut server = h.connect();
    let mut client = h.connect();
    h.register(&mut server, "/echo");

    client.request(0x11, "/echo", r#"{"same":1}"#);
    client.request(0x22, "/echo", r#"{"same":1}"#);
    h.cycle();
    let fwd = server.packets();
    assert_eq!(fwd.len(), 2);
    assert_ne!(fwd[0].reqid(), fwd[1].reqid());

    // Answer the second one first.
    server.respond(&fwd[1], r#"{"n":2}"#);
    h.cycle();
    let back = client.packets();
    assert_eq!(back.len(), 1);
    assert_eq!(back[0].reqid(), 0x22);
    assert_eq!(back[0].data(), br#"{"n":2}"#);

    server.respond(&fwd[0], r#"{"n":1}"#);
    h.cycle();
    let back = client.packets();
    assert_eq!(back[0].reqid(), 0x11);
    assert_eq!(back[0].data(), br#"{"n":1}"#);
    assert!(h.bus.pending_requests().is_empty());
}

#[test]
fn forward_ids_are_unique_across_callers() {
    let mut h = Harness::new(BusConfig::default());
    let mut server = h.connect();
    let mut a = h.connect();
    let mut b = h.connect();
    h.register(&mut server, "/svc");

    a.request(1, "/svc", "{}");
    b.request(1, "/svc", "{}");
    h.cycle();
    let fwd = server.packets();
    assert_eq!(fwd.len(), 2);
    assert_ne!(fwd[0].reqid(), fwd[1].reqid());

    server.respond(&fwd[1], r#"{"to":"b"}"#);
    server.respond(&fwd[0], r#"{"to":"a"}"#);
    h.cycle();
    assert_eq!(a.packets()[0].data(), br#"{"to":"a"}"#);
    assert_eq!(b.packets()[0].data(), br#"{"to":"b"}"#);
}

#[test]
fn service_lookup_needs_the_exact_header() {
    let mut h = Harness::new(BusConfig::default());
    let mut server = h.connect();
    let mut client = h.connect();
    h.register(&mut server, "/hello/x");

    for (reqid, header) in [
        (1, "/hello"),
        (2, "/hello/xy"),
        (3, "/hello/x/"),
        (4, "/"),
    ] {
        let req = client.request(reqid, header, "{}");
        h.cycle();
        let reply = client.packets();
        assert_eq!(reply.len(), 1, "{header}");
        assert_eq!(status(&reply[0]), Status::ServiceNotFound, "{header}");
        assert_eq!(reply[0].reqid(), reqid);
        assert_eq!(reply[0].reqcrc16(), req.crc16());
        assert_eq!(reply[0].header(), header);
    }
    assert!(server.packets().is_empty());
    assert!(h.bus.pending_requests().is_empty());
}

#[test]
fn request_without_a_path_header_is_dropped_as_noise() {
    let mut h = Harness::new(fast());
    let mut server = h.connect();
    let mut client = h.connect();
    h.register(&mut server, "/hello/x");

    let tail = ",0042:abc{}";
    let len = 1 + 4 + 4 + tail.len() + 6;
    let mut raw = format!(">0,$,{len:04x}{tail}").into_bytes();
    let crc = crc16(&raw);
    raw.push(0);
    raw.extend_from_slice(format!("{crc:04x}").as_bytes());
    raw.push(0);
    client.io.send(&raw).unwrap();
    h.cycle();
    assert!(client.packets().is_empty());
    assert!(server.packets().is_empty());
    assert!(h.bus.pending_requests().is_empty());
    assert!(h.bus.connection(client.handle()).unwrap().rx.is_empty());

    client.request(5, "/hello/x", "{}");
    h.cycle();
    assert_eq!(server.packets().len(), 1);
}

#[test]
fn two_memory_sinks_share_a_bus() {
    let first = MemSink::named("first");
    let second = MemSink::named("second");
    let (hub_a, hub_b) = (first.hub(), second.hub());
    let mut bus = Bus::new(BusConfig::default());
    bus.add_sink(first).unwrap();
    bus.add_sink(second).unwrap();

    let mut server = Peer {
        io: hub_a.connect("server"),
        enc: Encoder::new(),
    };
    let mut client = Peer {
        io: hub_b.connect("client"),
        enc: Encoder::new(),
    };
    bus.poll(Duration::ZERO).unwrap();
    assert_ne!(server.handle(), client.handle());
    assert!(server.io.is_open() && client.io.is_open());
    assert_eq!(bus.connection(server.handle()).unwrap().sink(), "first");
    assert_eq!(bus.connection(client.handle()).unwrap().sink(), "second");

    server.request(1, SERVICE_ADD, r#"{"header":"/across"}"#);
    bus.poll(Duration::ZERO).unwrap();
    assert_eq!(status(&server.packets()[0]), Status::Ok);

    client.request(9, "/across", r#"{"q":1}"#);
    bus.poll(Duration::ZERO).unwrap();
    let fwd = server.packets();
    assert_eq!(fwd.len(), 1);
    server.respond(&fwd[0], r#"{"a":1}"#);
    bus.poll(Duration::ZERO).unwrap();
    let back = client.packets();
    assert_eq!(back[0].reqid(), 9);
    assert_eq!(back[0].data(), br#"{"a":1}"#);
}
