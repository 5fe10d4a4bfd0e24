use criterion::{criterion_group, criterion_main, Criterion};
use ryton_collab::discovery::{resolved_peer, DiscoveryConfig, PeerRegistry, ResolvedService, SERVICE_TYPE};
use ryton_collab::identity::{LocalIdentity, PeerIdentity};
use ryton_collab::protocol::SignalFrame;
use std::hint::black_box;
use std::net::{IpAddr, Ipv4Addr};
use uuid::Uuid;

/// SDP of roughly the size a gathered offer with a few host candidates has.
fn sample_sdp() -> String {
    let mut sdp = String::from("v=0\r\no=- 8123 2 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\n");
    sdp.push_str("m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n");
    for i in 0..8 {
        sdp.push_str(&format!(
            "a=candidate:{i} 1 udp 2130706431 192.168.1.{i} 5{i}000 typ host\r\n"
        ));
    }
    sdp
}

fn bench_hello(c: &mut Criterion) {
    let id = Uuid::new_v4();

    c.bench_function("hello_encode", |b| {
        b.iter(|| {
            let frame = SignalFrame::hello(black_box(id), black_box("RytonIDE Peer_bench"), 9090);
            black_box(frame.encode().unwrap());
        })
    });
}

fn bench_offer(c: &mut Criterion) {
    let frame = SignalFrame::Offer { sdp: sample_sdp() };
    let encoded = frame.encode().unwrap();

    c.bench_function("offer_encode", |b| {
        b.iter(|| black_box(black_box(&frame).encode().unwrap()))
    });
    c.bench_function("offer_decode", |b| {
        b.iter(|| black_box(SignalFrame::decode(black_box(&encoded)).unwrap()))
    });
}

fn services() -> Vec<ResolvedService> {
    (0..200u16)
        .map(|i| ResolvedService {
            fullname: format!("RytonIDE Peer_{i} (9090).{SERVICE_TYPE}"),
            instance_id: Some(Uuid::new_v4()),
            name: Some(format!("RytonIDE Peer_{i}")),
            addresses: vec![
                IpAddr::from([0xfe80, 0, 0, 0, 0, 0, 0, i]),
                IpAddr::from([10, 0, (i / 250) as u8, (i % 250) as u8]),
            ],
            port: 9090,
        })
        .collect()
}

fn bench_resolved_peer(c: &mut Criterion) {
    let identity = LocalIdentity::new("RytonIDE Peer_bench", Ipv4Addr::new(192, 168, 1, 20), 9090);
    let config = DiscoveryConfig::default();
    let services = services();

    c.bench_function("resolved_peer_200_services", |b| {
        b.iter(|| {
            for service in &services {
                black_box(resolved_peer(&identity, &config, black_box(service)));
            }
        })
    });
}

fn bench_registry(c: &mut Criterion) {
    let identity = LocalIdentity::new("RytonIDE Peer_bench", Ipv4Addr::new(192, 168, 1, 20), 9090);
    let config = DiscoveryConfig::default();
    let peers: Vec<(String, PeerIdentity)> = services()
        .iter()
        .filter_map(|s| resolved_peer(&identity, &config, s).map(|p| (s.fullname.clone(), p)))
        .collect();

    c.bench_function("registry_refresh_200_peers", |b| {
        let mut registry = PeerRegistry::default();
        b.iter(|| {
            for (fullname, peer) in &peers {
                black_box(registry.observe(fullname, peer.clone()));
            }
        })
    });
}

criterion_group!(benches, bench_hello, bench_offer, bench_resolved_peer, bench_registry);
criterion_main!(benches);
