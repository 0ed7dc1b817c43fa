//! Integration tests for recording lifecycle, rotation and attribution

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tempfile::TempDir;

use chunkline::config::Config;
use chunkline::recording::{RecordingOptions, RecordingSession};
use chunkline::request::HookResult;
use chunkline::settings::{SettingKey, ENABLED, THRESHOLD};
use chunkline::storage::{read_chunk, Chunk, ChunkFileReader, ChunkRef, PurgeList};
use chunkline::stream::{FileStreamWriter, StreamLimits, StreamWriter};
use chunkline::{ChunklineError, Recorder, RecordingState};

/// Create a recorder over a temporary repository
fn create_recorder(dir: &TempDir) -> (Arc<Recorder>, Arc<FileStreamWriter>) {
    let writer = Arc::new(FileStreamWriter::new(StreamLimits::default()));
    let config = Config {
        repository: dir.path().to_path_buf(),
        abort_on_fatal: false,
        ..Config::default()
    };
    let recorder = Recorder::new(&config, Arc::clone(&writer) as Arc<dyn StreamWriter>).unwrap();
    (recorder, writer)
}

fn settings(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

fn chunk_paths(recorder: &Recorder, id: u64) -> Vec<PathBuf> {
    recorder
        .info(id)
        .unwrap()
        .chunks
        .into_iter()
        .map(|chunk| chunk.path)
        .collect()
}

#[test]
fn test_attribution_on_join() {
    let dir = TempDir::new().unwrap();
    let (recorder, writer) = create_recorder(&dir);
    let r1 = recorder.create_recording(RecordingOptions::named("r1")).unwrap();
    let r2 = recorder.create_recording(RecordingOptions::named("r2")).unwrap();

    r1.start().unwrap();
    writer.write_event("ev", b"only r1").unwrap();

    // Joining rotates exactly once: C1 goes to r1 only
    r2.start().unwrap();
    let r1_chunks = chunk_paths(&recorder, r1.id());
    assert_eq!(r1_chunks.len(), 1);
    assert!(chunk_paths(&recorder, r2.id()).is_empty());

    writer.write_event("ev", b"shared").unwrap();

    // Leaving rotates again: C2 goes to both
    r2.stop().unwrap();
    let r1_chunks = chunk_paths(&recorder, r1.id());
    let r2_chunks = chunk_paths(&recorder, r2.id());
    assert_eq!(r1_chunks.len(), 2);
    assert_eq!(r2_chunks.len(), 1);
    assert_eq!(r1_chunks[1], r2_chunks[0]);

    let shared = read_chunk(&r2_chunks[0]).unwrap();
    assert_eq!(shared.len(), 1);
    assert_eq!(shared[0].payload, b"shared");

    let first = read_chunk(&r1_chunks[0]).unwrap();
    assert_eq!(first[0].payload, b"only r1");
}

#[test]
fn test_chunk_times_are_contiguous() {
    let dir = TempDir::new().unwrap();
    let (recorder, _writer) = create_recorder(&dir);
    let r1 = recorder.create_recording(RecordingOptions::named("r1")).unwrap();
    let r2 = recorder.create_recording(RecordingOptions::named("r2")).unwrap();

    r1.start().unwrap();
    r2.start().unwrap();
    r2.stop().unwrap();
    r1.stop().unwrap();

    let chunks = recorder.info(r1.id()).unwrap().chunks;
    assert_eq!(chunks.len(), 3);
    for pair in chunks.windows(2) {
        assert_eq!(pair[0].end_nanos, Some(pair[1].start_nanos));
    }
}

#[test]
fn test_settings_union_across_recordings() {
    let dir = TempDir::new().unwrap();
    let (recorder, _writer) = create_recorder(&dir);
    let handle = recorder.register_event("app.Request");

    let r1 = recorder
        .create_recording(RecordingOptions {
            settings: settings(&[
                ("app.Request#enabled", "false"),
                ("app.Request#threshold", "20 ms"),
            ]),
            ..RecordingOptions::named("r1")
        })
        .unwrap();
    let r2 = recorder
        .create_recording(RecordingOptions {
            settings: settings(&[
                ("app.Request#enabled", "true"),
                ("app.Request#threshold", "5 ms"),
            ]),
            ..RecordingOptions::named("r2")
        })
        .unwrap();

    r1.start().unwrap();
    assert!(!handle.is_enabled());

    r2.start().unwrap();
    let effective = recorder.effective_settings();
    assert_eq!(
        effective.get(&SettingKey::new("app.Request", ENABLED)).map(String::as_str),
        Some("true")
    );
    assert_eq!(
        effective.get(&SettingKey::new("app.Request", THRESHOLD)).map(String::as_str),
        Some("5 ms")
    );
    assert!(handle.is_enabled());
    assert_eq!(handle.threshold(), Duration::from_millis(5));

    r2.stop().unwrap();
    assert!(!handle.is_enabled());

    r1.stop().unwrap();
    assert!(!handle.is_enabled());
}

#[test]
fn test_settings_change_rotates_only_when_effective() {
    let dir = TempDir::new().unwrap();
    let (recorder, _writer) = create_recorder(&dir);
    recorder.register_event("ev");
    let rec = recorder
        .create_recording(RecordingOptions {
            settings: settings(&[("ev#enabled", "true"), ("ev#threshold", "10 ms")]),
            ..RecordingOptions::named("r")
        })
        .unwrap();
    rec.start().unwrap();

    rec.set_setting("unknown#enabled", "true").unwrap();
    assert_eq!(rec.info().unwrap().chunks.len(), 0);

    rec.set_setting("ev#threshold", "1 ms").unwrap();
    assert_eq!(rec.info().unwrap().chunks.len(), 1);
    assert_eq!(
        recorder.registry().event("ev").unwrap().threshold(),
        Duration::from_millis(1)
    );
}

#[test]
fn test_close_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let (recorder, _writer) = create_recorder(&dir);
    let rec = recorder.create_recording(RecordingOptions::named("r")).unwrap();
    rec.start().unwrap();
    rec.stop().unwrap();
    let paths = chunk_paths(&recorder, rec.id());

    rec.close().unwrap();
    rec.close().unwrap();

    assert_eq!(rec.state().unwrap(), RecordingState::Closed);
    assert!(paths.iter().all(|path| !path.exists()));
    assert!(recorder.recordings().is_empty());
}

#[test]
fn test_close_running_recording_stops_stream() {
    let dir = TempDir::new().unwrap();
    let (recorder, writer) = create_recorder(&dir);
    let rec = recorder.create_recording(RecordingOptions::named("r")).unwrap();
    rec.start().unwrap();

    rec.close().unwrap();

    assert!(!writer.is_active());
    assert_eq!(rec.state().unwrap(), RecordingState::Closed);
}

#[test]
fn test_state_never_moves_backwards() {
    let dir = TempDir::new().unwrap();
    let (recorder, _writer) = create_recorder(&dir);
    let rec = recorder.create_recording(RecordingOptions::named("r")).unwrap();

    assert!(matches!(
        rec.stop(),
        Err(ChunklineError::InvalidTransition { .. })
    ));

    rec.start().unwrap();
    rec.stop().unwrap();
    assert!(matches!(
        rec.start(),
        Err(ChunklineError::InvalidTransition { .. })
    ));
    assert_eq!(rec.state().unwrap(), RecordingState::Stopped);
}

#[test]
fn test_stop_copies_to_destination_and_closes() {
    let dir = TempDir::new().unwrap();
    let (recorder, writer) = create_recorder(&dir);
    let destination = dir.path().join("out").join("r.dump");
    let rec = recorder
        .create_recording(RecordingOptions {
            destination: Some(destination.clone()),
            ..RecordingOptions::named("r")
        })
        .unwrap();

    rec.start().unwrap();
    writer.write_event("ev", b"one").unwrap();
    writer.write_event("ev", b"two").unwrap();
    rec.stop().unwrap();

    assert_eq!(rec.state().unwrap(), RecordingState::Closed);
    let records = read_chunk(&destination).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].payload, b"two");
}

#[test]
fn test_snapshot_of_running_recording() {
    let dir = TempDir::new().unwrap();
    let (recorder, writer) = create_recorder(&dir);
    let rec = recorder.create_recording(RecordingOptions::named("r")).unwrap();
    rec.start().unwrap();
    writer.write_event("ev", b"before").unwrap();

    let snapshot = rec.snapshot().unwrap();

    assert_eq!(rec.state().unwrap(), RecordingState::Running);
    assert_eq!(snapshot.state().unwrap(), RecordingState::Stopped);
    assert_eq!(snapshot.info().unwrap().chunks.len(), 1);
    assert_eq!(
        chunk_paths(&recorder, snapshot.id()),
        chunk_paths(&recorder, rec.id())
    );

    // Closing the source leaves the snapshot's chunks alive
    rec.close().unwrap();
    let paths = chunk_paths(&recorder, snapshot.id());
    assert!(paths[0].exists());
    assert_eq!(read_chunk(&paths[0]).unwrap()[0].payload, b"before");
}

#[test]
fn test_open_stream_requires_stopped() {
    let dir = TempDir::new().unwrap();
    let (recorder, writer) = create_recorder(&dir);
    let rec = recorder.create_recording(RecordingOptions::named("r")).unwrap();
    rec.start().unwrap();
    writer.write_event("ev", b"streamed").unwrap();

    assert!(matches!(
        rec.open_stream(0, u64::MAX),
        Err(ChunklineError::WrongState { .. })
    ));

    rec.stop().unwrap();
    let mut stream = rec.open_stream(0, u64::MAX).unwrap();
    let mut data = Vec::new();
    std::io::Read::read_to_end(&mut stream, &mut data).unwrap();

    assert_eq!(data.len() as u64, rec.info().unwrap().size);
    let records = ChunkFileReader::from_bytes(data).records().unwrap();
    assert_eq!(records[0].payload, b"streamed");

    // The window excludes everything before the recording
    let empty = rec.open_stream(0, 1).unwrap();
    assert!(empty.chunks().is_empty());
}

#[test]
fn test_dump_running_recording() {
    let dir = TempDir::new().unwrap();
    let (recorder, writer) = create_recorder(&dir);
    let rec = recorder.create_recording(RecordingOptions::named("r")).unwrap();
    rec.start().unwrap();
    writer.write_event("ev", b"dumped").unwrap();

    let target = dir.path().join("r.dump");
    let written = rec.dump(&target).unwrap();

    assert!(written > 0);
    assert_eq!(rec.state().unwrap(), RecordingState::Running);
    assert_eq!(read_chunk(&target).unwrap()[0].payload, b"dumped");
}

#[test]
fn test_retention_change_trims_running_recording() {
    let dir = TempDir::new().unwrap();
    let (recorder, writer) = create_recorder(&dir);
    let rec = recorder.create_recording(RecordingOptions::named("r")).unwrap();
    rec.start().unwrap();

    for _ in 0..3 {
        writer.write_event("ev", b"data").unwrap();
        assert!(recorder.rotate_chunk().unwrap());
    }
    let paths = chunk_paths(&recorder, rec.id());
    assert_eq!(paths.len(), 3);

    rec.set_max_size(Some(1)).unwrap();
    assert_eq!(chunk_paths(&recorder, rec.id()), vec![paths[2].clone()]);
    assert!(!paths[0].exists());
    assert!(!paths[1].exists());
    assert_eq!(rec.state().unwrap(), RecordingState::Running);

    std::thread::sleep(Duration::from_millis(10));
    rec.set_max_age(Some(Duration::from_millis(1))).unwrap();
    assert!(chunk_paths(&recorder, rec.id()).is_empty());
    assert!(!paths[2].exists());
}

#[test]
fn test_switch_to_disk_leaves_memory_mode() {
    let dir = TempDir::new().unwrap();
    let (recorder, writer) = create_recorder(&dir);
    let rec = recorder
        .create_recording(RecordingOptions {
            to_disk: false,
            ..RecordingOptions::named("mem")
        })
        .unwrap();
    rec.start().unwrap();
    assert!(writer.is_in_memory());
    writer.write_event("ev", b"buffered").unwrap();

    rec.set_to_disk(true).unwrap();

    assert!(!writer.is_in_memory());
    let paths = chunk_paths(&recorder, rec.id());
    assert_eq!(paths.len(), 1);
    assert_eq!(read_chunk(&paths[0]).unwrap()[0].payload, b"buffered");

    writer.write_event("ev", b"on disk").unwrap();
    rec.stop().unwrap();
    let paths = chunk_paths(&recorder, rec.id());
    assert_eq!(paths.len(), 2);
    assert_eq!(read_chunk(&paths[1]).unwrap()[0].payload, b"on disk");
}

#[test]
fn test_filter_stopped_recording() {
    let dir = TempDir::new().unwrap();
    let (recorder, _writer) = create_recorder(&dir);
    let rec = recorder.create_recording(RecordingOptions::named("r")).unwrap();
    let other = recorder.create_recording(RecordingOptions::named("o")).unwrap();

    rec.start().unwrap();
    other.start().unwrap();
    other.stop().unwrap();
    assert!(rec.filter(None, None, Some(1)).is_err());
    rec.stop().unwrap();
    assert_eq!(rec.info().unwrap().chunks.len(), 3);

    rec.filter(None, None, Some(1)).unwrap();
    assert_eq!(rec.info().unwrap().chunks.len(), 1);
}

#[test]
fn test_boundary_hooks_fire_for_enabled_event() {
    let dir = TempDir::new().unwrap();
    let (recorder, writer) = create_recorder(&dir);
    let fired = Arc::new(AtomicUsize::new(0));
    let hook_fired = Arc::clone(&fired);
    let hook_writer = Arc::clone(&writer);
    recorder.register_periodic_event(
        "app.Stats",
        Arc::new(move || -> HookResult {
            hook_fired.fetch_add(1, Ordering::SeqCst);
            hook_writer.write_event("app.Stats", b"stats")?;
            Ok(())
        }),
    );

    let disabled = recorder.create_recording(RecordingOptions::named("quiet")).unwrap();
    disabled.start().unwrap();
    disabled.stop().unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    let rec = recorder
        .create_recording(RecordingOptions {
            settings: settings(&[("app.Stats#enabled", "true")]),
            ..RecordingOptions::named("stats")
        })
        .unwrap();
    rec.start().unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    rec.stop().unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 2);

    let chunk = &rec.info().unwrap().chunks[0];
    let records = read_chunk(&chunk.path).unwrap();
    assert_eq!(records.len(), 2);
}

#[test]
fn test_chunk_reference_counting() {
    let dir = TempDir::new().unwrap();
    let purge = Arc::new(PurgeList::new(8));
    let path = dir.path().join("counted.chunk");
    let first = Chunk::create(&path, purge).unwrap();
    first.finish(1).unwrap();

    let refs: Vec<ChunkRef> = (0..4).map(|_| first.clone()).collect();
    assert_eq!(first.ref_count(), 5);

    drop(refs);
    assert!(path.exists());
    drop(first);
    assert!(!path.exists());
}

#[tokio::test]
async fn test_scheduled_start() {
    let dir = TempDir::new().unwrap();
    let (recorder, _writer) = create_recorder(&dir);
    let rec = recorder.create_recording(RecordingOptions::named("later")).unwrap();

    rec.schedule_start(Duration::from_millis(50)).unwrap();
    assert_eq!(rec.state().unwrap(), RecordingState::Delayed);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(rec.state().unwrap(), RecordingState::Running);
}

#[tokio::test]
async fn test_close_cancels_scheduled_start() {
    let dir = TempDir::new().unwrap();
    let (recorder, writer) = create_recorder(&dir);
    let rec = recorder.create_recording(RecordingOptions::named("never")).unwrap();

    rec.schedule_start(Duration::from_millis(50)).unwrap();
    rec.close().unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(rec.state().unwrap(), RecordingState::Closed);
    assert!(!writer.is_active());
}

#[tokio::test]
async fn test_duration_stops_recording() {
    let dir = TempDir::new().unwrap();
    let (recorder, _writer) = create_recorder(&dir);
    let rec = recorder
        .create_recording(RecordingOptions {
            duration: Some(Duration::from_millis(50)),
            ..RecordingOptions::named("timed")
        })
        .unwrap();

    rec.start().unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(rec.state().unwrap(), RecordingState::Stopped);
    assert_eq!(rec.info().unwrap().chunks.len(), 1);
}

#[tokio::test]
async fn test_set_duration_on_running_recording() {
    let dir = TempDir::new().unwrap();
    let (recorder, _writer) = create_recorder(&dir);
    let rec = recorder.create_recording(RecordingOptions::named("open")).unwrap();
    rec.start().unwrap();

    rec.set_duration(Some(Duration::from_millis(50))).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(rec.state().unwrap(), RecordingState::Stopped);
}

#[tokio::test]
async fn test_set_duration_extends_deadline() {
    let dir = TempDir::new().unwrap();
    let (recorder, _writer) = create_recorder(&dir);
    let rec = recorder
        .create_recording(RecordingOptions {
            duration: Some(Duration::from_millis(50)),
            ..RecordingOptions::named("extended")
        })
        .unwrap();
    rec.start().unwrap();

    rec.set_duration(Some(Duration::from_secs(60))).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(rec.state().unwrap(), RecordingState::Running);

    // Clearing the duration keeps it running until stopped by hand
    rec.set_duration(None).unwrap();
    rec.stop().unwrap();
    assert_eq!(rec.state().unwrap(), RecordingState::Stopped);
}

#[tokio::test]
async fn test_periodic_event_follows_period_setting() {
    let dir = TempDir::new().unwrap();
    let (recorder, _writer) = create_recorder(&dir);
    let fired = Arc::new(AtomicUsize::new(0));
    let hook_fired = Arc::clone(&fired);
    recorder.register_periodic_event(
        "app.Tick",
        Arc::new(move || -> HookResult {
            hook_fired.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );

    let rec = recorder
        .create_recording(RecordingOptions {
            settings: settings(&[("app.Tick#enabled", "true"), ("app.Tick#period", "20 ms")]),
            ..RecordingOptions::named("ticks")
        })
        .unwrap();
    rec.start().unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(fired.load(Ordering::SeqCst) >= 2);

    rec.stop().unwrap();
}

#[test]
fn test_shutdown_dumps_on_exit() {
    let dir = TempDir::new().unwrap();
    let (recorder, writer) = create_recorder(&dir);
    let rec = recorder
        .create_recording(RecordingOptions {
            dump_on_exit: true,
            ..RecordingOptions::named("exit")
        })
        .unwrap();
    rec.start().unwrap();
    writer.write_event("ev", b"last words").unwrap();

    recorder.shutdown().unwrap();

    let dump = dir.path().join(format!("exit-{}.dump", rec.id()));
    assert_eq!(read_chunk(&dump).unwrap()[0].payload, b"last words");
    assert!(!writer.is_active());
    assert!(!recorder.repository().path().exists());
}

#[test]
fn test_repository_failure_is_returned() {
    let dir = TempDir::new().unwrap();
    let blocked = dir.path().join("blocked");
    std::fs::write(&blocked, b"not a directory").unwrap();

    let config = Config {
        repository: blocked,
        abort_on_fatal: false,
        ..Config::default()
    };
    let writer: Arc<dyn StreamWriter> = Arc::new(FileStreamWriter::new(StreamLimits::default()));

    assert!(matches!(
        Recorder::new(&config, writer),
        Err(ChunklineError::RepositoryUnavailable { .. })
    ));
}

fn finished_chunk(
    dir: &TempDir,
    purge: &Arc<PurgeList>,
    index: usize,
    size: usize,
    end: u64,
) -> ChunkRef {
    let path = dir.path().join(format!("{index}.chunk"));
    let chunk = Chunk::create(&path, Arc::clone(purge)).unwrap();
    std::fs::write(&path, vec![0u8; size]).unwrap();
    chunk.set_start_time(index as u64);
    chunk.finish(end).unwrap();
    chunk
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_size_retention_keeps_newest_suffix(
        sizes in prop::collection::vec(1usize..2000, 1..12),
        max_size in 1u64..5000,
    ) {
        let dir = TempDir::new().unwrap();
        let purge = Arc::new(PurgeList::new(16));
        let mut session = RecordingSession::new(
            1,
            RecordingOptions {
                max_size: Some(max_size),
                ..RecordingOptions::named("prop")
            },
        );

        for (i, size) in sizes.iter().enumerate() {
            let chunk = finished_chunk(&dir, &purge, i, *size, i as u64 + 1);
            session.append_chunk(chunk, i as u64 + 1);
        }

        let kept: Vec<u64> = session.chunks().map(|chunk| chunk.start_time()).collect();
        prop_assert!(!kept.is_empty());
        prop_assert!(session.size() <= max_size || kept.len() == 1);

        // Retained chunks are the newest, in order
        let first = sizes.len() - kept.len();
        let expected: Vec<u64> = (first..sizes.len()).map(|i| i as u64).collect();
        prop_assert_eq!(kept, expected);

        // Dropping one more (older) chunk would have been unnecessary
        if first > 0 {
            prop_assert!(session.size() + sizes[first - 1] as u64 > max_size);
        }
    }

    #[test]
    fn prop_age_retention_drops_expired(
        ends in prop::collection::vec(0u64..100, 1..10),
        max_age in 1u64..50,
    ) {
        let dir = TempDir::new().unwrap();
        let purge = Arc::new(PurgeList::new(16));
        let mut session = RecordingSession::new(
            1,
            RecordingOptions {
                max_age: Some(Duration::from_nanos(max_age)),
                ..RecordingOptions::named("prop")
            },
        );

        let mut sorted = ends.clone();
        sorted.sort_unstable();
        let now = sorted.last().copied().unwrap_or(0) + 1;
        for (i, end) in sorted.iter().enumerate() {
            session.append_chunk(finished_chunk(&dir, &purge, i, 1, *end), now);
        }

        let oldest_allowed = now.saturating_sub(max_age);
        for chunk in session.chunks() {
            prop_assert!(chunk.end_time().unwrap() >= oldest_allowed);
        }

        // Every unexpired chunk survives
        let expected = sorted.iter().filter(|end| **end >= oldest_allowed).count();
        prop_assert_eq!(session.chunk_count(), expected);
    }
}
