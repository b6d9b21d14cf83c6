// SPDX-License-Identifier: BSD-3-Clause-LBNL
use crate::assembler::*;
use crate::carve::CarvedRange;
use crate::config::ReconstructionConfig;
use crate::content_range::ContentRange;
use crate::errors::Error;
use crate::flow::{Direction, Flow, TransferKey, Transport};
use crate::reconstructed_file::ReconstructedFile;
use crate::session::testing::RecordingEvents;
use crate::session::Session;
use crate::transfer::TransferType;
use rand::seq::SliceRandom;
use rand::Rng;
use std::fs;
use std::path::{Component, Path};
use std::sync::Arc;
use tempfile::tempdir;

fn flow(client_port: u16) -> Flow {
    Flow::new(
        Transport::Tcp,
        format!("10.0.0.1:{client_port}").parse().unwrap(),
        "10.0.0.2:80".parse().unwrap(),
    )
}

fn registry_with(
    output: &Path,
    configure: impl FnOnce(&mut ReconstructionConfig),
) -> (AssemblerRegistry, Arc<RecordingEvents>) {
    let mut config = ReconstructionConfig::with_output_directory(output);
    configure(&mut config);
    let events = Arc::new(RecordingEvents::default());
    let session = Arc::new(Session::new(config, events.clone()));
    (AssemblerRegistry::new(session), events)
}

fn registry(output: &Path) -> (AssemblerRegistry, Arc<RecordingEvents>) {
    registry_with(output, |_| {})
}

fn http_get(flow: Flow, filename: &str, content_length: u64) -> FileStreamAssemblerBuilder {
    FileStreamAssemblerBuilder::new(flow, Direction::ServerToClient, TransferType::HttpGetNormal)
        .filename(filename)
        .content_length(content_length)
        .details(format!("http://example.com/{filename}"))
}

fn key(flow: &Flow) -> TransferKey {
    TransferKey::new(flow, Direction::ServerToClient, None)
}

#[test]
fn test_simple_get_sniffs_gif() {
    let dir = tempdir().unwrap();
    let (mut registry, events) = registry(dir.path());
    let mut payload = b"GIF89a".to_vec();
    payload.resize(300, 0x2A);

    let assembler = http_get(flow(50000), "image", 300).build(registry.session());
    assert!(registry.add_or_enqueue(assembler));
    let key = key(&flow(50000));
    assert!(registry.add_data(&key, &payload[0..100], 0).is_empty());
    assert!(registry.add_data(&key, &payload[100..200], 100).is_empty());
    let files = registry.add_data(&key, &payload[200..300], 200);

    assert_eq!(files.len(), 1);
    let file = &files[0];
    assert_eq!(file.size(), 300);
    assert_eq!(file.extension_from_header(), Some("gif"));
    assert_eq!(file.filename(), "image.gif");
    assert!(file.is_image());
    assert_eq!(fs::read(file.path()).unwrap(), payload);
    assert!(file
        .path()
        .starts_with(dir.path().join("HTTP").join("10.0.0.2").join("TCP-80")));
    assert_eq!(file.relative_uri(), Some("HTTP/10.0.0.2/TCP-80/image.gif"));
    assert!(!registry.contains(&key));
    assert!(registry.session().scratch_files().is_empty());
    assert_eq!(events.files.lock().len(), 1);
}

fn range_payload() -> Vec<u8> {
    (0..200u32).map(|i| (i * 7 % 256) as u8).collect()
}

fn deliver_ranges(registry: &mut AssemblerRegistry) -> Vec<ReconstructedFile> {
    let data = range_payload();
    let mut emitted = Vec::new();
    for (start, end) in [(0u64, 149u64), (100, 199)] {
        let range = ContentRange::new(start, end, Some(200)).unwrap();
        let assembler = http_get(flow(50000), "big.bin", range.len())
            .content_range(range)
            .build(registry.session());
        registry.add_or_enqueue(assembler);
        emitted.extend(registry.add_data(
            &key(&flow(50000)),
            &data[start as usize..=end as usize],
            0,
        ));
    }
    emitted
}

#[test]
fn test_range_merge_keeps_fragments() {
    let dir = tempdir().unwrap();
    let (mut registry, _) = registry(dir.path());
    let emitted = deliver_ranges(&mut registry);

    // both ranges plus the merged file
    assert_eq!(emitted.len(), 3);
    let merged = &emitted[2];
    assert_eq!(merged.size(), 200);
    assert_eq!(fs::read(merged.path()).unwrap(), range_payload());
    assert_eq!(merged.filename(), "big[2].bin");
    assert!(emitted[0].path().exists() && emitted[1].path().exists());
    assert_eq!(registry.partial_count(), 0);
}

#[test]
fn test_range_merge_without_partial_extraction() {
    let dir = tempdir().unwrap();
    let (mut registry, events) =
        registry_with(dir.path(), |c| c.extract_partial_downloads = false);
    let emitted = deliver_ranges(&mut registry);

    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].filename(), "big.bin");
    assert_eq!(fs::read(emitted[0].path()).unwrap(), range_payload());
    let siblings = fs::read_dir(emitted[0].path().parent().unwrap())
        .unwrap()
        .count();
    assert_eq!(siblings, 1);
    assert_eq!(events.files.lock().len(), 1);
}

#[test]
fn test_chunked_response_is_dechunked() {
    let dir = tempdir().unwrap();
    let (mut registry, _) = registry(dir.path());
    let assembler = FileStreamAssemblerBuilder::new(
        flow(50001),
        Direction::ServerToClient,
        TransferType::HttpGetChunked,
    )
    .filename("wiki.txt")
    .build(registry.session());
    registry.add_or_enqueue(assembler);

    let key = key(&flow(50001));
    assert!(registry.add_data(&key, b"4\r\nWiki\r\n", 0).is_empty());
    let files = registry.add_data(&key, b"5\r\npedia\r\n0\r\n\r\n", 9);
    assert_eq!(files.len(), 1);
    assert_eq!(fs::read(files[0].path()).unwrap(), b"Wikipedia");
    assert_eq!(files[0].size(), 9);
}

#[test]
fn test_path_traversal_stays_inside_output() {
    let dir = tempdir().unwrap();
    let (mut registry, _) = registry_with(dir.path(), |c| c.defang_executable_files = true);
    let mut payload = b"MZ".to_vec();
    payload.resize(64, 0);
    let assembler = http_get(flow(50002), "../../secret.exe", 64)
        .location("/downloads/../../")
        .build(registry.session());
    registry.add_or_enqueue(assembler);

    let files = registry.add_data(&key(&flow(50002)), &payload, 0);
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].filename(), "secret.exe_");
    let relative = files[0].path().strip_prefix(dir.path()).unwrap();
    assert!(relative
        .components()
        .all(|c| matches!(c, Component::Normal(_))));
}

#[test]
fn test_shuffled_fragments_reassemble_in_order() {
    let dir = tempdir().unwrap();
    let (mut registry, _) = registry(dir.path());
    let mut rng = rand::rng();

    let mut payload = Vec::new();
    let mut fragments = Vec::new();
    for _ in 0..40 {
        let len = rng.random_range(1..50);
        let fragment: Vec<u8> = (0..len).map(|_| rng.random()).collect();
        fragments.push((payload.len() as u64, fragment.clone()));
        payload.extend(fragment);
    }
    fragments.shuffle(&mut rng);

    let assembler = FileStreamAssemblerBuilder::new(
        flow(50003),
        Direction::ServerToClient,
        TransferType::Ftp,
    )
    .filename("shuffled.bin")
    .content_length(payload.len() as u64)
    .build(registry.session());
    registry.add_or_enqueue(assembler);

    let key = key(&flow(50003));
    let mut files = Vec::new();
    for (offset, fragment) in &fragments {
        files.extend(registry.add_data(&key, fragment, *offset));
    }
    assert_eq!(files.len(), 1);
    assert_eq!(fs::read(files[0].path()).unwrap(), payload);
}

#[test]
fn test_duplicate_fragments_are_idempotent() {
    let dir = tempdir().unwrap();
    let (mut registry, _) = registry(dir.path());
    let assembler = FileStreamAssemblerBuilder::new(
        flow(50004),
        Direction::ServerToClient,
        TransferType::Imap,
    )
    .filename("mail.eml")
    .build(registry.session());
    registry.add_or_enqueue(assembler);

    let key = key(&flow(50004));
    for (seq, data) in [
        (0, &b"Subject: "[..]),
        (9, &b"hi"[..]),
        (0, &b"Subject: "[..]),
        (9, &b"XX"[..]),
    ] {
        registry.add_data(&key, data, seq);
    }
    let files = registry.finish(&key);
    assert_eq!(fs::read(files[0].path()).unwrap(), b"Subject: hi");
}

#[test]
fn test_queued_assembler_is_promoted() {
    let dir = tempdir().unwrap();
    let (mut registry, _) = registry(dir.path());
    let first = http_get(flow(50005), "first.txt", 3).build(registry.session());
    let second = http_get(flow(50005), "second.txt", 3).build(registry.session());
    let key = key(&flow(50005));

    assert!(registry.add_or_enqueue(first));
    assert!(!registry.add_or_enqueue(second));
    assert_eq!(registry.queued_len(&key), 1);

    let files = registry.add_data(&key, b"one", 0);
    assert_eq!(files[0].filename(), "first.txt");
    assert!(registry.contains(&key));
    assert_eq!(registry.queued_len(&key), 0);

    let files = registry.add_data(&key, b"two", 0);
    assert_eq!(files[0].filename(), "second.txt");
    assert_eq!(fs::read(files[0].path()).unwrap(), b"two");
    assert!(registry.is_empty());
}

#[test]
fn test_same_destination_gets_numbered() {
    let dir = tempdir().unwrap();
    let (mut registry, _) = registry(dir.path());
    let mut names = Vec::new();
    for content in [b"aaa", b"bbb", b"ccc"] {
        let assembler = http_get(flow(50006), "name.ext", 3).build(registry.session());
        registry.add_or_enqueue(assembler);
        let files = registry.add_data(&key(&flow(50006)), content, 0);
        names.push(files[0].filename());
    }
    assert_eq!(names, vec!["name.ext", "name[1].ext", "name[2].ext"]);
}

#[test]
fn test_eviction_discards_oldest_transfer() {
    let dir = tempdir().unwrap();
    let (mut registry, events) = registry_with(dir.path(), |c| c.registry_capacity = 2);
    let mut scratch = Vec::new();
    for port in [50010, 50011, 50012] {
        let assembler = http_get(flow(port), "f.bin", 10).build(registry.session());
        scratch.push(assembler.scratch_path().to_path_buf());
        registry.add_or_enqueue(assembler);
    }
    assert_eq!(registry.len(), 2);
    assert!(!registry.contains(&key(&flow(50010))));
    assert!(!scratch[0].exists());
    assert!(scratch[2].exists());
    assert!(events.anomalies.lock()[0].contains("evicted"));
    assert_eq!(registry.session().scratch_files().len(), 2);
}

#[test]
fn test_multipart_upload_spawns_children() {
    let dir = tempdir().unwrap();
    let (mut registry, events) = registry(dir.path());
    let body: &[u8] = b"--XyZ\r\n\
Content-Disposition: form-data; name=\"comment\"\r\n\r\n\
hello\r\n\
--XyZ\r\n\
Content-Disposition: form-data; name=\"upload\"; filename=\"notes.txt\"\r\n\
Content-Type: text/plain\r\n\r\n\
line one\r\n\
--XyZ--\r\n";
    let assembler = FileStreamAssemblerBuilder::new(
        flow(50007),
        Direction::ClientToServer,
        TransferType::HttpPostMimeMultipartFormData,
    )
    .filename("upload.php")
    .content_length(body.len() as u64)
    .content_type("multipart/form-data; boundary=XyZ")
    .build(registry.session());
    registry.add_or_enqueue(assembler);

    let key = TransferKey::new(&flow(50007), Direction::ClientToServer, None);
    let files = registry.add_data(&key, body, 0);
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].filename(), "notes.txt");
    assert_eq!(files[0].transfer_type(), TransferType::HttpPostMimeFileData);
    assert_eq!(fs::read(files[0].path()).unwrap(), b"line one");
    assert!(files[0]
        .path()
        .starts_with(dir.path().join("HTTP").join("10.0.0.1").join("TCP-50007")));
    assert_eq!(events.form_parts.lock().len(), 2);
    assert!(registry.session().scratch_files().is_empty());
}

#[test]
fn test_segment_overflow_discards_assembler() {
    let dir = tempdir().unwrap();
    let (mut registry, events) = registry(dir.path());
    let segment = FileSegmentAssembler::new(
        registry.session(),
        flow(50008),
        Direction::ServerToClient,
        TransferType::Smb2,
        "a.bin",
        "",
        4,
        "",
        None,
        1,
        chrono::Utc::now(),
    );
    registry.add_or_enqueue(segment);
    let key = key(&flow(50008));

    assert!(registry.add_segment_data(&key, 0, b"ab", 1).unwrap().is_empty());
    let err = registry.add_segment_data(&key, 2, b"xyz", 2).unwrap_err();
    assert!(matches!(
        err,
        Error::Segment(SegmentError::ExceedsDeclaredSize { .. })
    ));
    assert!(!registry.contains(&key));
    assert_eq!(events.anomalies.lock().len(), 1);
    assert!(registry.session().scratch_files().is_empty());
}

#[test]
fn test_clear_empties_output_but_keeps_cache() {
    let dir = tempdir().unwrap();
    let (mut registry, _) = registry(dir.path());
    let done = http_get(flow(50009), "done.txt", 2).build(registry.session());
    registry.add_or_enqueue(done);
    registry.add_data(&key(&flow(50009)), b"ok", 0);
    let pending = http_get(flow(50020), "pending.txt", 10).build(registry.session());
    registry.add_or_enqueue(pending);
    registry.add_data(&key(&flow(50020)), b"half", 0);

    registry.clear(true);
    assert!(registry.is_empty());
    assert!(registry.session().scratch_files().is_empty());
    let remaining: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(remaining, vec![std::ffi::OsString::from("cache")]);
    assert_eq!(fs::read_dir(dir.path().join("cache")).unwrap().count(), 0);
}

#[test]
fn test_clear_after_many_fragments_drops_the_transfer() {
    let dir = tempdir().unwrap();
    let (mut registry, _) = registry(dir.path());
    let assembler = http_get(flow(50030), "long.bin", 1000).build(registry.session());
    registry.add_or_enqueue(assembler);
    let key = key(&flow(50030));
    for seq in 0..18u64 {
        assert!(registry.add_data(&key, b"x", seq).is_empty());
    }
    assert!(registry.contains(&key));

    registry.clear(false);
    assert!(registry.is_empty());
    assert!(!registry.contains(&key));
    assert!(registry.session().scratch_files().is_empty());
}

#[test]
fn test_clear_deletes_unemitted_range_fragments() {
    let dir = tempdir().unwrap();
    let (mut registry, events) =
        registry_with(dir.path(), |c| c.extract_partial_downloads = false);
    let data = range_payload();
    let range = ContentRange::new(0, 149, Some(200)).unwrap();
    let assembler = http_get(flow(50000), "big.bin", range.len())
        .content_range(range)
        .build(registry.session());
    registry.add_or_enqueue(assembler);
    assert!(registry
        .add_data(&key(&flow(50000)), &data[..150], 0)
        .is_empty());
    assert_eq!(registry.partial_count(), 1);
    let location = dir.path().join("HTTP").join("10.0.0.2").join("TCP-80");
    assert_eq!(fs::read_dir(&location).unwrap().count(), 1);

    registry.clear(false);
    assert_eq!(registry.partial_count(), 0);
    assert_eq!(fs::read_dir(&location).unwrap().count(), 0);
    assert!(events.files.lock().is_empty());
}

#[test]
fn test_registered_carver_runs_on_emit() {
    let dir = tempdir().unwrap();
    let events = Arc::new(RecordingEvents::default());
    let carver = |_: &ReconstructedFile| {
        vec![CarvedRange {
            extension: "gif".to_string(),
            start: 4,
            length: 6,
        }]
    };
    let session = Session::new(
        ReconstructionConfig::with_output_directory(dir.path()),
        events.clone(),
    )
    .with_carver(TransferType::Meterpreter, Box::new(carver));
    let mut registry = AssemblerRegistry::new(Arc::new(session));

    let assembler = FileStreamAssemblerBuilder::new(
        flow(50030),
        Direction::ServerToClient,
        TransferType::Meterpreter,
    )
    .filename("stage.bin")
    .content_length(12)
    .build(registry.session());
    registry.add_or_enqueue(assembler);
    let files = registry.add_data(&key(&flow(50030)), b"junkGIF89ajj", 0);

    assert_eq!(files.len(), 2);
    assert_eq!(files[1].filename(), "stage_4.gif");
    assert_eq!(fs::read(files[1].path()).unwrap(), b"GIF89a");
    assert_eq!(events.files.lock().len(), 2);
}

#[test]
fn test_shared_registry_across_threads() {
    let dir = tempdir().unwrap();
    let (registry, events) = registry(dir.path());
    let shared = registry.shared();

    std::thread::scope(|scope| {
        for port in 50040..50044u16 {
            let shared = shared.clone();
            scope.spawn(move || {
                let key = key(&flow(port));
                {
                    let mut registry = shared.lock();
                    let assembler = http_get(flow(port), "t.txt", 8)
                        .build(registry.session());
                    registry.add_or_enqueue(assembler);
                }
                for (seq, half) in [(0, b"abcd"), (4, b"efgh")] {
                    shared.lock().add_data(&key, half, seq);
                }
            });
        }
    });
    assert_eq!(events.files.lock().len(), 4);
    assert!(shared.lock().is_empty());
}
