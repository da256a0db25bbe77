//! Store and daemon round trips against real temporary directories.

use std::path::Path;

use core_cache::{
    AddJobRequest, Cache, CacheStore, DaemonCache, EvictionCommand, EvictionSink, FindJobRequest,
    InputFile, NullSink, OutputFile,
};

struct Recorder(Vec<EvictionCommand>);

impl EvictionSink for Recorder {
    fn send(&mut self, cmd: EvictionCommand) {
        self.0.push(cmd);
    }
}

fn add_request(scratch: &Path, name: &str, content: &[u8], input_hash: &str) -> AddJobRequest {
    let src = scratch.join(name);
    std::fs::write(&src, content).unwrap();
    let mut req = AddJobRequest {
        cwd: "/workspace".into(),
        command_line: "cc\0-c\0a.c".into(),
        environment: "PATH=/bin\0".into(),
        stdin: String::new(),
        stdout: "compiled".into(),
        status: 0,
        runtime: 1.25,
        obytes: content.len() as u64,
        ..AddJobRequest::default()
    };
    req.inputs.push(InputFile {
        path: "a.c".into(),
        hash: input_hash.into(),
    });
    req.outputs.push(OutputFile {
        source: src.display().to_string(),
        path: format!("out/{name}"),
        hash: core_cache::fsutil::hash_bytes(content),
        mode: 0o644,
    });
    req.seal_bloom();
    req
}

fn find_request(input_hash: &str) -> FindJobRequest {
    let mut req = FindJobRequest {
        cwd: "/workspace".into(),
        command_line: "cc\0-c\0a.c".into(),
        environment: "PATH=/bin\0".into(),
        stdin: String::new(),
        ..FindJobRequest::default()
    };
    req.visible.insert("a.c".into(), input_hash.into());
    req.seal_bloom();
    req
}

#[test]
fn add_then_read_restores_outputs() {
    let root = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();

    let mut store = CacheStore::open(root.path()).unwrap();
    let mut sink = Recorder(Vec::new());
    let add = add_request(scratch.path(), "lib.o", b"object bytes", "aabb01");
    let job_id = store.add(&add, &mut sink).unwrap();
    assert!(matches!(sink.0[0], EvictionCommand::Write { size } if size == job_id));

    // The blob landed in its shard.
    let blob = root
        .path()
        .join(core_cache::fsutil::group_name(job_id))
        .join(job_id.to_string())
        .join(core_cache::fsutil::hash_bytes(b"object bytes"));
    assert!(blob.exists());

    let mut req = find_request("aabb01");
    req.dir_redirects
        .insert("out".into(), dest.path().display().to_string());
    let hit = store.read(&req, &mut sink).unwrap().expect("cache hit");
    assert_eq!(hit.output_info.stdout, "compiled");
    assert_eq!(hit.output_info.runtime, 1.25);
    assert!(matches!(sink.0[1], EvictionCommand::Read { job_id: j } if j == job_id));

    // The output file was restored through the redirect.
    let restored = dest.path().join("lib.o");
    assert_eq!(std::fs::read(&restored).unwrap(), b"object bytes");
}

#[test]
fn changed_input_hash_misses() {
    let root = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let mut store = CacheStore::open(root.path()).unwrap();
    let add = add_request(scratch.path(), "lib.o", b"v1", "1111aa");
    store.add(&add, &mut NullSink).unwrap();

    // Same key strings, different content hash for the input.
    let req = find_request("2222bb");
    assert!(store.read(&req, &mut NullSink).unwrap().is_none());
}

#[test]
fn superset_visible_still_hits() {
    let root = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let mut store = CacheStore::open(root.path()).unwrap();
    let add = add_request(scratch.path(), "lib.o", b"v1", "1111aa");
    store.add(&add, &mut NullSink).unwrap();

    let mut req = find_request("1111aa");
    // Extra visible files must not prevent the match.
    req.visible.insert("extra.h".into(), "9999ff".into());
    req.seal_bloom();
    req.dir_redirects
        .insert("out".into(), dest.path().display().to_string());
    assert!(store.read(&req, &mut NullSink).unwrap().is_some());
}

#[test]
fn missing_input_in_visible_misses() {
    let root = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let mut store = CacheStore::open(root.path()).unwrap();
    let add = add_request(scratch.path(), "lib.o", b"v1", "1111aa");
    store.add(&add, &mut NullSink).unwrap();

    // The requester cannot see a.c at all: bloom may pass, row check must
    // reject.
    let mut req = find_request("1111aa");
    req.visible.clear();
    assert!(store.read(&req, &mut NullSink).unwrap().is_none());
}

#[test]
fn rows_without_blobs_read_as_miss() {
    let root = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let mut store = CacheStore::open(root.path()).unwrap();
    let add = add_request(scratch.path(), "lib.o", b"orphan", "abcd12");
    let job_id = store.add(&add, &mut NullSink).unwrap();

    // Simulate the converse skew: rows present, blob directory gone.
    let job_dir = root
        .path()
        .join(core_cache::fsutil::group_name(job_id))
        .join(job_id.to_string());
    std::fs::remove_dir_all(&job_dir).unwrap();

    let mut req = find_request("abcd12");
    req.dir_redirects
        .insert("out".into(), dest.path().display().to_string());
    assert!(
        store.read(&req, &mut NullSink).unwrap().is_none(),
        "partial entries must read as a miss"
    );
    // No partial output appeared at the destination.
    assert!(!dest.path().join("lib.o").exists());
}

#[test]
fn daemon_and_client_round_trip() {
    let root = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();

    let mut daemon = DaemonCache::new(root.path(), 1 << 30, 1 << 29, false).unwrap();
    let root_path = root.path().to_path_buf();
    let handle = std::thread::spawn(move || {
        let _ = daemon.run();
    });

    let mut client = Cache::connect(&root_path).unwrap();
    let add = add_request(scratch.path(), "net.o", b"net bytes", "fe12aa");
    client.add(&add).unwrap();

    let mut req = find_request("fe12aa");
    req.dir_redirects
        .insert("out".into(), dest.path().display().to_string());
    // The add is processed before the read on the daemon's single service
    // loop, so this read observes it.
    let resp = client.read(&req).unwrap();
    assert!(resp.found);
    let hit = resp.matched.expect("match body");
    assert_eq!(hit.output_info.stdout, "compiled");
    assert_eq!(
        std::fs::read(dest.path().join("net.o")).unwrap(),
        b"net bytes"
    );

    let miss = client.read(&find_request("00ff00")).unwrap();
    assert!(!miss.found);

    drop(client);
    drop(handle); // daemon thread exits on its own idle timeout
}

#[test]
fn scheduler_adapter_speaks_json() {
    use core_jobs::JobCache;

    let root = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();

    let mut daemon = DaemonCache::new(root.path(), 1 << 30, 1 << 29, false).unwrap();
    let root_path = root.path().to_path_buf();
    std::thread::spawn(move || {
        let _ = daemon.run();
    });

    let mut client = Cache::connect(&root_path).unwrap();
    let add = add_request(scratch.path(), "adapt.o", b"adapted", "77aa00");
    JobCache::add(&mut client, &serde_json::to_string(&add).unwrap());

    let mut req = find_request("77aa00");
    req.dir_redirects
        .insert("out".into(), dest.path().display().to_string());
    let response = JobCache::read(&mut client, &serde_json::to_string(&req).unwrap())
        .expect("daemon reachable");
    assert!(response.contains("\"found\":true"));
    assert_eq!(
        std::fs::read(dest.path().join("adapt.o")).unwrap(),
        b"adapted"
    );
}

#[test]
fn second_daemon_loses_the_lock_race() {
    let root = tempfile::tempdir().unwrap();
    let _first = DaemonCache::new(root.path(), 1 << 20, 1 << 19, false).unwrap();
    let second = DaemonCache::new(root.path(), 1 << 20, 1 << 19, false);
    assert!(second.is_err());
}
