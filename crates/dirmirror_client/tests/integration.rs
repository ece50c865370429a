//! End-to-end tests: a real server watching a temp tree, mirrors over loopback TCP.

use bytes::BytesMut;
use dirmirror_client::{ClientConfig, MirrorApplier, MirrorClient, RetryConfig};
use dirmirror_protocol::{encode_frame, Frame, FrameDecoder, FrameLimits, IgnoreRules, SyncMessage};
use dirmirror_server::{ClientRegistry, ServerConfig, SyncServer};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(20);

struct Fixture {
    _dir: tempfile::TempDir,
    root: PathBuf,
    staging: PathBuf,
    scratch: PathBuf,
    addr: SocketAddr,
    registry: Arc<ClientRegistry>,
    server: JoinHandle<dirmirror_server::ServerResult<()>>,
}

impl Fixture {
    async fn start(configure: impl FnOnce(ServerConfig) -> ServerConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("source");
        let staging = dir.path().join("staging");
        fs::create_dir(&root).unwrap();
        fs::create_dir(&staging).unwrap();

        let config = configure(ServerConfig::new("127.0.0.1:0".parse().unwrap(), &root));
        let server = SyncServer::bind(config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let registry = server.registry();

        Self {
            scratch: dir.path().to_path_buf(),
            _dir: dir,
            root,
            staging,
            addr,
            registry,
            server: tokio::spawn(server.run()),
        }
    }

    fn client_config(&self, name: &str) -> ClientConfig {
        ClientConfig::new(self.addr.to_string(), self.scratch.join(name))
            .with_retry(RetryConfig::no_retry())
    }

    async fn mirror(&self, name: &str, rules: &[&str]) -> (Arc<MirrorClient>, PathBuf) {
        let config = self
            .client_config(name)
            .with_ignore_rules(rules.iter().copied().collect());
        self.spawn_mirror(config).await
    }

    async fn spawn_mirror(&self, config: ClientConfig) -> (Arc<MirrorClient>, PathBuf) {
        let expected = self.registry.len() + 1;
        let client = Arc::new(MirrorClient::new(config).unwrap());
        let root = client.applier().root().to_path_buf();

        let runner = Arc::clone(&client);
        tokio::spawn(async move { runner.run().await });
        self.wait_for_sessions(expected).await;
        (client, root)
    }

    async fn wait_for_sessions(&self, count: usize) {
        let registry = Arc::clone(&self.registry);
        wait_until(move || registry.len() == count).await;
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// A bare peer that records frames instead of applying them.
struct RawPeer {
    stream: TcpStream,
    decoder: FrameDecoder,
    buf: BytesMut,
}

impl RawPeer {
    async fn connect(addr: SocketAddr, rules: IgnoreRules) -> Self {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(&encode_frame(&Frame::Handshake(rules)).unwrap())
            .await
            .unwrap();
        Self {
            stream,
            decoder: FrameDecoder::new(FrameLimits::default()),
            buf: BytesMut::new(),
        }
    }

    /// Returns the next message, or None if nothing arrives within `quiet`.
    async fn next(&mut self, quiet: Duration) -> Option<SyncMessage> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.buf).unwrap() {
                match frame {
                    Frame::Sync(message) => return Some(message),
                    Frame::Handshake(_) => panic!("server sent a handshake"),
                }
            }
            match tokio::time::timeout(quiet, self.stream.read_buf(&mut self.buf)).await {
                Ok(Ok(0)) | Err(_) => return None,
                Ok(Ok(_)) => {}
                Ok(Err(e)) => panic!("read failed: {e}"),
            }
        }
    }

    /// Collects messages until one satisfies `done`.
    async fn until(&mut self, done: impl Fn(&SyncMessage) -> bool) -> Vec<SyncMessage> {
        let mut seen = Vec::new();
        loop {
            let message = self
                .next(WAIT)
                .await
                .unwrap_or_else(|| panic!("stream went quiet; saw {seen:?}"));
            let finished = done(&message);
            seen.push(message);
            if finished {
                return seen;
            }
        }
    }

    /// Collects whatever arrives until the stream is quiet for `quiet`.
    async fn drain(&mut self, quiet: Duration) -> Vec<SyncMessage> {
        let mut seen = Vec::new();
        while let Some(message) = self.next(quiet).await {
            seen.push(message);
        }
        seen
    }
}

async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn has_content(path: &Path, expected: &[u8]) -> bool {
    fs::read(path).map(|data| data == expected).unwrap_or(false)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn large_file_arrives_byte_identical() {
    let fixture = Fixture::start(|c| c).await;
    let (_client, mirror) = fixture.mirror("mirror", &[]).await;

    let content = vec![b'$'; 2 * 1024 * 1024];
    let staged = fixture.staging.join("big.bin");
    fs::write(&staged, &content).unwrap();
    fs::rename(&staged, fixture.root.join("big.bin")).unwrap();

    let target = mirror.join("big.bin");
    wait_until(|| has_content(&target, &content)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn large_file_written_in_place_arrives_byte_identical() {
    let fixture = Fixture::start(|c| c).await;
    let (client, mirror) = fixture.mirror("mirror", &[]).await;

    // Written straight into the tree: the creation notice may see a partial
    // file, the close-after-write notice sees all of it.
    let content = vec![b'$'; 2 * 1024 * 1024];
    fs::write(fixture.root.join("direct.bin"), &content).unwrap();

    let target = mirror.join("direct.bin");
    wait_until(|| has_content(&target, &content)).await;
    assert_eq!(client.stats().failed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oversized_file_is_skipped_and_mirrors_stay_connected() {
    let limits = FrameLimits::new(1024);
    let fixture = Fixture::start(|c| c.with_limits(limits)).await;
    let (client, mirror) = fixture
        .spawn_mirror(fixture.client_config("mirror").with_limits(limits))
        .await;

    let staged = fixture.staging.join("big.bin");
    fs::write(&staged, vec![b'x'; 2048]).unwrap();
    fs::rename(&staged, fixture.root.join("big.bin")).unwrap();
    fs::write(fixture.root.join("small.txt"), b"still syncing").unwrap();

    wait_until(|| has_content(&mirror.join("small.txt"), b"still syncing")).await;
    assert!(!mirror.join("big.bin").exists());
    assert_eq!(fixture.registry.len(), 1);
    assert_eq!(client.state(), dirmirror_client::ClientState::Streaming);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn directory_moved_out_then_deleted_keeps_later_deletes() {
    let fixture = Fixture::start(|c| c).await;
    let mut peer = RawPeer::connect(fixture.addr, IgnoreRules::new()).await;
    fixture.wait_for_sessions(1).await;
    let (_client, mirror) = fixture.mirror("mirror", &[]).await;

    fs::create_dir(fixture.root.join("d")).unwrap();
    wait_until(|| mirror.join("d").is_dir()).await;

    fs::rename(fixture.root.join("d"), fixture.staging.join("d")).unwrap();
    fs::remove_dir(fixture.staging.join("d")).unwrap();
    wait_until(|| !mirror.join("d").exists()).await;

    fs::write(fixture.root.join("d"), b"file now").unwrap();
    wait_until(|| has_content(&mirror.join("d"), b"file now")).await;
    fs::remove_file(fixture.root.join("d")).unwrap();
    wait_until(|| !mirror.join("d").exists()).await;

    fs::write(fixture.root.join("marker"), b"").unwrap();
    let seen = peer
        .until(|m| *m == SyncMessage::create_file("marker", Vec::new()))
        .await;
    let count = |wanted: &SyncMessage| seen.iter().filter(|m| *m == wanted).count();
    assert_eq!(count(&SyncMessage::DeleteDir { path: "d".into() }), 1, "{seen:?}");
    assert_eq!(count(&SyncMessage::DeleteFile { path: "d".into() }), 1, "{seen:?}");
    assert!(!mirror.join("d").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn directory_delete_emits_one_delete_dir() {
    let fixture = Fixture::start(|c| c).await;
    let mut peer = RawPeer::connect(fixture.addr, IgnoreRules::new()).await;
    fixture.wait_for_sessions(1).await;

    fs::create_dir(fixture.root.join("d")).unwrap();
    peer
        .until(|m| *m == SyncMessage::CreateDir { path: "d".into() })
        .await;
    fs::write(fixture.root.join("d/f.txt"), b"inside").unwrap();
    peer
        .until(|m| *m == SyncMessage::create_file("d/f.txt", b"inside".to_vec()))
        .await;

    fs::remove_dir_all(fixture.root.join("d")).unwrap();
    let mut seen = peer
        .until(|m| matches!(m, SyncMessage::DeleteDir { .. }))
        .await;
    seen.extend(peer.drain(Duration::from_millis(750)).await);

    let dir_deletes: Vec<_> = seen
        .iter()
        .filter(|m| matches!(m, SyncMessage::DeleteDir { .. }))
        .collect();
    assert_eq!(dir_deletes, vec![&SyncMessage::DeleteDir { path: "d".into() }]);

    // Replaying the deletion on a mirror twice changes nothing the second time.
    let scratch = tempfile::tempdir().unwrap();
    let applier = MirrorApplier::open(scratch.path()).unwrap();
    applier
        .apply(&SyncMessage::create_file("d/f.txt", b"inside".to_vec()))
        .unwrap();
    for message in dir_deletes.iter().chain(dir_deletes.iter()) {
        applier.apply(message).unwrap();
    }
    assert!(!scratch.path().join("d").exists());
    assert_eq!(fs::read_dir(scratch.path()).unwrap().count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mirror_follows_create_move_delete() {
    let fixture = Fixture::start(|c| c).await;
    let (client, mirror) = fixture.mirror("mirror", &[]).await;

    fs::create_dir(fixture.root.join("docs")).unwrap();
    wait_until(|| mirror.join("docs").is_dir()).await;

    fs::write(fixture.root.join("docs/a.txt"), b"alpha").unwrap();
    wait_until(|| has_content(&mirror.join("docs/a.txt"), b"alpha")).await;

    fs::rename(fixture.root.join("docs/a.txt"), fixture.root.join("b.txt")).unwrap();
    wait_until(|| has_content(&mirror.join("b.txt"), b"alpha") && !mirror.join("docs/a.txt").exists())
        .await;

    fs::rename(fixture.root.join("docs"), fixture.root.join("papers")).unwrap();
    wait_until(|| mirror.join("papers").is_dir() && !mirror.join("docs").exists()).await;

    // The renamed directory is still watched under its new name.
    fs::write(fixture.root.join("papers/c.txt"), b"gamma").unwrap();
    wait_until(|| has_content(&mirror.join("papers/c.txt"), b"gamma")).await;

    fs::remove_file(fixture.root.join("b.txt")).unwrap();
    wait_until(|| !mirror.join("b.txt").exists()).await;

    fs::rename(fixture.root.join("papers"), fixture.staging.join("papers")).unwrap();
    wait_until(|| !mirror.join("papers").exists()).await;

    assert_eq!(client.stats().failed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ignored_extensions_are_not_mirrored() {
    let fixture = Fixture::start(|c| c).await;
    let (_picky, picky_root) = fixture.mirror("picky", &["tmp", ".log"]).await;
    let (_plain, plain_root) = fixture.mirror("plain", &[]).await;

    for name in ["a.tmp", "b.log", "c.txt"] {
        fs::write(fixture.root.join(name), name.as_bytes()).unwrap();
    }
    wait_until(|| {
        ["a.tmp", "b.log", "c.txt"]
            .iter()
            .all(|name| has_content(&plain_root.join(name), name.as_bytes()))
    })
    .await;
    wait_until(|| has_content(&picky_root.join("c.txt"), b"c.txt")).await;

    assert!(!picky_root.join("a.tmp").exists());
    assert!(!picky_root.join("b.log").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_mirror_sees_only_later_changes() {
    let fixture = Fixture::start(|c| c).await;
    let mut early = RawPeer::connect(fixture.addr, IgnoreRules::new()).await;
    fixture.wait_for_sessions(1).await;

    fs::write(fixture.root.join("before.txt"), b"old").unwrap();
    early
        .until(|m| *m == SyncMessage::create_file("before.txt", b"old".to_vec()))
        .await;

    let (_client, mirror) = fixture.mirror("late", &[]).await;
    fs::write(fixture.root.join("after.txt"), b"new").unwrap();
    wait_until(|| has_content(&mirror.join("after.txt"), b"new")).await;

    assert!(!mirror.join("before.txt").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stalled_peer_does_not_hold_back_mirror() {
    let fixture = Fixture::start(|c| {
        c.with_session_queue_capacity(4)
            .with_send_timeout(Duration::from_millis(500))
    })
    .await;

    // Handshakes, then never reads.
    let _stalled = RawPeer::connect(fixture.addr, IgnoreRules::new()).await;
    fixture.wait_for_sessions(1).await;
    let (_client, mirror) = fixture.mirror("mirror", &[]).await;

    let payload = vec![b'#'; 256 * 1024];
    for i in 0..64 {
        let staged = fixture.staging.join(format!("f{i}.bin"));
        fs::write(&staged, &payload).unwrap();
        fs::rename(&staged, fixture.root.join(format!("f{i}.bin"))).unwrap();
    }

    wait_until(|| (0..64).all(|i| has_content(&mirror.join(format!("f{i}.bin")), &payload))).await;
    fixture.wait_for_sessions(1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mirror_returns_when_server_stops() {
    let fixture = Fixture::start(|c| c).await;
    let config = ClientConfig::new(fixture.addr.to_string(), fixture.scratch.join("m"))
        .with_retry(RetryConfig::no_retry());
    let client = Arc::new(MirrorClient::new(config).unwrap());
    let runner = Arc::clone(&client);
    let task = tokio::spawn(async move { runner.run().await });
    fixture.wait_for_sessions(1).await;

    fixture.server.abort();
    // Aborting the accept loop leaves sessions alone; release them explicitly.
    for session in fixture.registry.snapshot() {
        fixture.registry.remove(session.id());
    }

    tokio::time::timeout(WAIT, task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(client.state(), dirmirror_client::ClientState::Closed);
}
