//! Hosted loopback: the agent runs inside the test process and the client
//! connects to it over the real shared-memory channel, exercising every
//! command end to end.
#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use rcxrpm_cli::{MemoryProvider, RemoteProcessProvider, RpcSession, SessionCache, TargetSpec};
use rcxrpm_shared::{boot, Channel, Error, Status, DATA_SIZE};

const TOKEN: &str = "0123456789abcdef";

fn pattern_buffer(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i & 0xFF) as u8).collect()
}

/// Guaranteed-unmapped address in the test host.
const UNMAPPED: u64 = 0xDEAD_0000;

/// One sequential pass over the whole session lifecycle. The agent is a
/// process-wide singleton, so every scenario shares this test body.
#[test]
fn hosted_loopback_session() {
    let pid = std::process::id();

    // If the payload was linked with its loader hooks, a constructor-driven
    // instance may already exist; clear it so this session owns the channel.
    rcxrpm_payload::teardown();

    // Host setup: publish the token, load the agent "into ourselves".
    let guard = boot::publish_token(pid, TOKEN).expect("publish bootstrap");
    rcxrpm_payload::init().expect("agent init");
    let session = RpcSession::connect(pid, TOKEN).expect("connect");
    drop(guard);
    assert!(rcxrpm_payload::is_ready());

    // Ping twice: both OK on a live session.
    session.ping().expect("first ping");
    session.ping().expect("second ping");

    // Module list shape: non-empty, first entry's base matches the header's
    // image base, and some module covers it (the main executable).
    let modules = session.enumerate_modules().expect("enumerate modules");
    assert!(!modules.is_empty());
    let image_base = session.image_base();
    assert_ne!(image_base, 0);
    assert_eq!(modules[0].base, image_base);
    assert!(modules.iter().any(|m| m.contains(image_base)));

    // Known-pattern read, byte-exact.
    let host_buf = pattern_buffer(65536);
    let host_addr = host_buf.as_ptr() as u64;
    let mut read_back = vec![0u8; 4096];
    let status = session.read(host_addr, &mut read_back).expect("pattern read");
    assert_eq!(status, Status::Ok);
    assert_eq!(read_back, &host_buf[..4096]);

    // Batch read: four 1 KiB slices in one round trip, request order kept.
    let requests: Vec<(u64, u32)> = (0..4).map(|i| (host_addr + i * 1024, 1024)).collect();
    let batch = session.read_batch(&requests).expect("batch read");
    assert_eq!(batch.status, Status::Ok);
    assert_eq!(batch.data.len(), 4);
    for (i, chunk) in batch.data.iter().enumerate() {
        assert_eq!(chunk.as_slice(), &host_buf[i * 1024..(i + 1) * 1024]);
    }

    // Patch-and-verify: 4 bytes in, same 4 bytes out, neighbours untouched.
    let mut patch_target = pattern_buffer(4096);
    let patch_addr = patch_target.as_mut_ptr() as u64;
    session
        .write(patch_addr, &[0xDE, 0xAD, 0xBE, 0xEF])
        .expect("patch write");
    let mut verify = vec![0u8; 8];
    assert_eq!(session.read(patch_addr, &mut verify).unwrap(), Status::Ok);
    assert_eq!(&verify[..4], &[0xDE, 0xAD, 0xBE, 0xEF]);
    assert_eq!(&verify[4..], &pattern_buffer(8)[4..]);
    assert_eq!(&patch_target[4..], &pattern_buffer(4096)[4..]);

    // Unreadable read: PARTIAL, destination fully zeroed.
    let mut hole = vec![0xAAu8; 64];
    let status = session.read(UNMAPPED, &mut hole).expect("unreadable read");
    assert_eq!(status, Status::Partial);
    assert!(hole.iter().all(|&b| b == 0));

    // A range straddling valid and invalid memory: readable part exact.
    let tail = vec![0x42u8; 32];
    let straddle = session
        .read_batch(&[(tail.as_ptr() as u64, 32), (UNMAPPED, 32)])
        .expect("straddling batch");
    assert_eq!(straddle.status, Status::Partial);
    assert_eq!(straddle.data[0], tail);
    assert!(straddle.data[1].iter().all(|&b| b == 0));

    // Write to unmapped memory is rejected and touches nothing.
    assert!(matches!(
        session.write(UNMAPPED, &[1, 2, 3, 4]),
        Err(Error::WriteRejected)
    ));

    // Client-side validation: zero length and over-capacity never transmit.
    let mut empty: [u8; 0] = [];
    assert!(matches!(
        session.read(host_addr, &mut empty),
        Err(Error::ProtocolError(_))
    ));
    assert!(matches!(
        session.write(host_addr, &[]),
        Err(Error::ProtocolError(_))
    ));

    // Capacity boundary: the largest single read fits exactly once...
    let max_len = (DATA_SIZE - 16) as u32;
    let batch = session
        .read_batch(&[(host_addr, max_len)])
        .expect("max-size read");
    assert_eq!(batch.data[0].len(), max_len as usize);
    assert_eq!(&batch.data[0][..host_buf.len()], host_buf.as_slice());
    // ...and is refused at one byte more.
    assert!(matches!(
        session.read_batch(&[(host_addr, max_len + 1)]),
        Err(Error::ProtocolError(_))
    ));

    // Address 0 is allowed; it simply reads as unmapped.
    let mut zero_page = vec![0xFFu8; 16];
    assert_eq!(
        session.read(0, &mut zero_page).expect("read address 0"),
        Status::Partial
    );
    assert!(zero_page.iter().all(|&b| b == 0));

    // Single-flight under contention: concurrent readers interleave whole
    // round trips and every one sees consistent data.
    let shared = Arc::new(session);
    let mut workers = Vec::new();
    for _ in 0..4 {
        let session = Arc::clone(&shared);
        let expected = host_buf.clone();
        workers.push(std::thread::spawn(move || {
            let mut buf = vec![0u8; 1024];
            for _ in 0..50 {
                let status = session.read(expected.as_ptr() as u64, &mut buf).unwrap();
                assert_eq!(status, Status::Ok);
                assert_eq!(buf.as_slice(), &expected[..1024]);
            }
        }));
    }
    for worker in workers {
        worker.join().expect("reader thread");
    }
    let session = Arc::try_unwrap(shared).ok().expect("sole session owner");

    // Provider facade over the shared cache.
    let cache = Arc::new(SessionCache::new());
    let spec = TargetSpec {
        pid,
        token: TOKEN.to_string(),
        name: "loopback-host".to_string(),
    };
    let provider = RemoteProcessProvider::open(Arc::clone(&cache), &spec).expect("provider");
    assert_eq!(provider.kind(), "RemoteProcess");
    assert!(provider.is_live());
    assert!(provider.is_readable());
    assert_eq!(provider.name(), "loopback-host");
    assert_eq!(provider.base(), image_base);
    assert!(provider.ping());

    let mut via_provider = vec![0u8; 256];
    assert!(provider.read(host_addr, &mut via_provider));
    assert_eq!(via_provider.as_slice(), &host_buf[..256]);
    // Failed reads come back false with a zeroed buffer.
    assert!(!provider.read(UNMAPPED, &mut via_provider));
    assert!(via_provider.iter().all(|&b| b == 0));

    let exe_module = provider
        .modules()
        .iter()
        .find(|m| m.contains(image_base))
        .cloned()
        .expect("module covering image base");
    let symbol = provider.get_symbol(image_base + 0x40).expect("symbol");
    assert_eq!(symbol, format!("{}+0x40", exe_module.name));
    assert_eq!(
        provider.symbol_to_address(&exe_module.name.to_uppercase()),
        exe_module.base
    );
    assert_eq!(provider.symbol_to_address("no-such-module"), 0);
    drop(provider);

    // Shutdown is final: readiness clears within 500 ms, later calls fail
    // fast with Disconnected.
    session.shutdown().expect("shutdown");
    assert!(!session.is_connected());
    assert!(matches!(session.ping(), Err(Error::Disconnected)));

    let monitor = Channel::open(pid, Some(TOKEN), Duration::from_millis(200))
        .expect("channel still mapped until teardown");
    let deadline = Instant::now() + Duration::from_millis(500);
    while monitor.header().payload_ready() {
        assert!(Instant::now() < deadline, "payload_ready did not clear");
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(!rcxrpm_payload::is_ready());
    drop(monitor);

    // Module unload: names vanish, and the cell accepts a fresh session.
    rcxrpm_payload::teardown();
    assert!(matches!(
        Channel::open(pid, Some(TOKEN), Duration::from_millis(50)),
        Err(Error::NotReady(_))
    ));

    let guard = boot::publish_token(pid, "feedfacefeedface").expect("re-publish");
    rcxrpm_payload::init().expect("re-init after teardown");
    let second = RpcSession::connect(pid, "feedfacefeedface").expect("reconnect");
    drop(guard);
    second.ping().expect("ping on second session");
    second.shutdown().expect("second shutdown");
    rcxrpm_payload::teardown();
}

#[test]
fn connect_to_absent_agent_times_out() {
    let err = RpcSession::connect_with_timeout(u32::MAX - 7, TOKEN, Duration::from_millis(80))
        .unwrap_err();
    assert!(matches!(err, Error::NotReady(_)));
}
