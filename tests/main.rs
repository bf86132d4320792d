// Integration tests against a real kqueue. Every test drives its own
// session inside a fresh temporary directory.
//
// The worker synthesizes directory events by re-listing, so tests give
// it a moment between filesystem operations where ordering matters.

use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use inotify_kqueue::{EventMask, EventOwned, Inotify, WatchMask};
use tempfile::TempDir;

const DEADLINE: Duration = Duration::from_secs(5);
const SETTLE: Duration = Duration::from_millis(300);

#[test]
fn it_should_watch_a_file() {
    let mut testdir = TestDir::new();
    let (path, mut file) = testdir.new_file();

    let mut inotify = init();
    let watch = inotify.add_watch(&path, WatchMask::MODIFY).unwrap();

    write_to(&mut file);

    let events = gather(&mut inotify, |events| !events.is_empty());

    assert!(!events.is_empty());
    for event in &events {
        assert_eq!(watch.get_watch_descriptor_id(), event.wd.get_watch_descriptor_id());
        assert!(event.mask.contains(EventMask::MODIFY));
        assert_eq!(event.name, None);
    }
}

#[test]
fn it_should_return_immediately_if_no_events_are_available() {
    let mut inotify = init();

    let mut buffer = [0; 1024];
    assert_eq!(inotify.read_events(&mut buffer).unwrap().count(), 0);
}

#[test]
fn it_should_not_accept_watchdescriptors_from_other_instances() {
    let mut testdir = TestDir::new();
    let (path, _) = testdir.new_file();

    let mut inotify = init();
    let _ = inotify.add_watch(&path, WatchMask::MODIFY).unwrap();

    let mut second_inotify = init();
    let wd2 = second_inotify.add_watch(&path, WatchMask::MODIFY).unwrap();

    assert_eq!(
        inotify.rm_watch(wd2).unwrap_err().kind(),
        std::io::ErrorKind::InvalidInput
    );
}

#[test]
fn repeated_add_returns_the_same_id() {
    let mut testdir = TestDir::new();
    let (path, _) = testdir.new_file();

    let mut inotify = init();
    let first = inotify.add_watch(&path, WatchMask::MODIFY).unwrap();
    let second = inotify
        .add_watch(&path, WatchMask::MODIFY | WatchMask::ATTRIB)
        .unwrap();

    assert_eq!(first, second);
}

// Scenario: start a session, add a watch, remove it, stop. The stream
// holds exactly one IGNORED record for the watch.
#[test]
fn start_stop_yields_a_single_ignored_record() {
    let testdir = TestDir::new();

    let mut inotify = init();
    let watch = inotify
        .add_watch(testdir.path(), WatchMask::CREATE | WatchMask::DELETE)
        .unwrap();
    let id = watch.get_watch_descriptor_id();

    inotify.rm_watch(watch).unwrap();

    let events = gather(&mut inotify, |events| !events.is_empty());
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].wd.get_watch_descriptor_id(), id);
    assert_eq!(events[0].mask, EventMask::IGNORED);
    assert_eq!(events[0].cookie, 0);
    assert_eq!(events[0].name, None);

    inotify.close().unwrap();
}

// Scenario: touch a file inside a watched directory. A CREATE with the
// entry's name arrives, and once the child is tracked, writes to it
// surface as MODIFY against the directory watch.
#[test]
fn a_created_child_is_reported_and_then_tracked() {
    let mut testdir = TestDir::new();

    let mut inotify = init();
    let watch = inotify
        .add_watch(
            testdir.path(),
            WatchMask::CREATE | WatchMask::MODIFY | WatchMask::DELETE,
        )
        .unwrap();

    let (path, mut file) = testdir.new_file();
    let name = path.file_name().unwrap().to_os_string();

    let created = gather(&mut inotify, |events| {
        events.iter().any(|e| e.mask.contains(EventMask::CREATE))
    });
    let create = created
        .iter()
        .find(|e| e.mask.contains(EventMask::CREATE))
        .expect("expected a CREATE event");
    assert_eq!(create.wd.get_watch_descriptor_id(), watch.get_watch_descriptor_id());
    assert_eq!(create.name.as_ref(), Some(&name));
    assert!(!create.mask.contains(EventMask::ISDIR));

    // The child has its own watch now; modifications carry its name.
    write_to(&mut file);
    let modified = gather(&mut inotify, |events| {
        events.iter().any(|e| e.mask.contains(EventMask::MODIFY))
    });
    let modify = modified
        .iter()
        .find(|e| e.mask.contains(EventMask::MODIFY))
        .expect("expected a MODIFY event");
    assert_eq!(modify.wd.get_watch_descriptor_id(), watch.get_watch_descriptor_id());
    assert_eq!(modify.name.as_ref(), Some(&name));
}

// Scenario: rename within a directory. MOVED_FROM is followed
// immediately by MOVED_TO, with the same fresh cookie and no event in
// between.
#[test]
fn a_rename_is_reported_as_a_contiguous_pair() {
    let mut testdir = TestDir::new();
    let (path, _) = testdir.new_file();

    let mut inotify = init();
    let watch = inotify.add_watch(testdir.path(), WatchMask::MOVE).unwrap();

    let target = testdir.path().join("renamed-to");
    fs::rename(&path, &target).unwrap();

    let events = gather(&mut inotify, |events| events.len() >= 2);
    assert!(events.len() >= 2);

    let from = events
        .iter()
        .position(|e| e.mask.contains(EventMask::MOVED_FROM))
        .expect("expected a MOVED_FROM event");
    let to = &events[from + 1];

    assert!(to.mask.contains(EventMask::MOVED_TO));
    assert_eq!(events[from].cookie, to.cookie);
    assert_ne!(to.cookie, 0);
    assert_eq!(
        events[from].name.as_ref(),
        Some(&path.file_name().unwrap().to_os_string())
    );
    assert_eq!(to.name.as_ref(), Some(&target.file_name().unwrap().to_os_string()));
    for event in &events {
        assert_eq!(event.wd.get_watch_descriptor_id(), watch.get_watch_descriptor_id());
    }
}

// Scenario: atomically rename one file over another watched entry. The
// surviving name now backs a different file; writes to it must still
// be reported under that name.
#[test]
fn a_replaced_child_is_still_tracked_under_its_name() {
    let mut testdir = TestDir::new();
    let (target, _) = testdir.new_file();
    let (source, _) = testdir.new_file();
    let name = target.file_name().unwrap().to_os_string();

    let mut inotify = init();
    let watch = inotify
        .add_watch(testdir.path(), WatchMask::MODIFY)
        .unwrap();

    // Clobber the target; its old inode is gone, the name remains.
    fs::rename(&source, &target).unwrap();
    thread::sleep(SETTLE);

    let mut replacement = fs::OpenOptions::new().append(true).open(&target).unwrap();
    write_to(&mut replacement);

    let events = gather(&mut inotify, |events| {
        events.iter().any(|e| e.mask.contains(EventMask::MODIFY))
    });
    let modify = events
        .iter()
        .find(|e| e.mask.contains(EventMask::MODIFY))
        .expect("expected a MODIFY event for the replacement file");
    assert_eq!(modify.wd.get_watch_descriptor_id(), watch.get_watch_descriptor_id());
    assert_eq!(modify.name.as_ref(), Some(&name));
}

// Scenario: delete a file inside a watched directory, while a second
// watch sits directly on the file. The directory reports DELETE with
// the name; the file watch reports DELETE_SELF and ends with IGNORED.
#[test]
fn a_deleted_child_is_reported_on_both_watches() {
    let mut testdir = TestDir::new();
    let (path, _) = testdir.new_file();
    let name = path.file_name().unwrap().to_os_string();

    let mut inotify = init();
    let dir_watch = inotify.add_watch(testdir.path(), WatchMask::DELETE).unwrap();
    let file_watch = inotify
        .add_watch(&path, WatchMask::DELETE_SELF)
        .unwrap();

    fs::remove_file(&path).unwrap();

    let events = gather(&mut inotify, |events| {
        events.iter().any(|e| e.mask.contains(EventMask::DELETE))
            && events.iter().any(|e| e.mask.contains(EventMask::IGNORED))
    });

    let delete = events
        .iter()
        .find(|e| e.mask.contains(EventMask::DELETE))
        .expect("expected a DELETE event");
    assert_eq!(delete.wd.get_watch_descriptor_id(), dir_watch.get_watch_descriptor_id());
    assert_eq!(delete.name.as_ref(), Some(&name));

    let file_events: Vec<_> = events
        .iter()
        .filter(|e| e.wd.get_watch_descriptor_id() == file_watch.get_watch_descriptor_id())
        .collect();
    assert!(file_events
        .iter()
        .any(|e| e.mask.contains(EventMask::DELETE_SELF)));
    assert_eq!(
        file_events.last().map(|e| e.mask),
        Some(EventMask::IGNORED)
    );
    for event in &file_events {
        assert_eq!(event.name, None);
    }
}

// Scenario: delete the watched directory itself. DELETE_SELF arrives,
// then IGNORED, then nothing.
#[test]
fn a_deleted_directory_reports_delete_self_then_ignored() {
    let testdir = TestDir::new();
    let victim = testdir.path().join("victim");
    fs::create_dir(&victim).unwrap();

    let mut inotify = init();
    let watch = inotify
        .add_watch(&victim, WatchMask::DELETE_SELF | WatchMask::DELETE)
        .unwrap();

    fs::remove_dir(&victim).unwrap();

    let events = gather(&mut inotify, |events| {
        events.iter().any(|e| e.mask.contains(EventMask::IGNORED))
    });

    let self_delete = events
        .iter()
        .position(|e| e.mask.contains(EventMask::DELETE_SELF))
        .expect("expected a DELETE_SELF event");
    let ignored = events
        .iter()
        .position(|e| e.mask.contains(EventMask::IGNORED))
        .expect("expected an IGNORED event");
    assert!(self_delete < ignored);
    assert_eq!(ignored, events.len() - 1);
    for event in &events {
        assert_eq!(event.wd.get_watch_descriptor_id(), watch.get_watch_descriptor_id());
    }
}

// Scenario: narrow the mask by re-adding. Events the narrowed mask no
// longer contains stop coming.
#[test]
fn re_adding_with_a_narrower_mask_filters_events() {
    let mut testdir = TestDir::new();

    let mut inotify = init();
    let watch = inotify
        .add_watch(
            testdir.path(),
            WatchMask::MODIFY | WatchMask::CREATE | WatchMask::DELETE,
        )
        .unwrap();

    let (path, _) = testdir.new_file();
    let created = gather(&mut inotify, |events| {
        events.iter().any(|e| e.mask.contains(EventMask::CREATE))
    });
    assert!(created.iter().any(|e| e.mask.contains(EventMask::CREATE)));

    let narrowed = inotify
        .add_watch(testdir.path(), WatchMask::MODIFY)
        .unwrap();
    assert_eq!(watch, narrowed);

    fs::remove_file(&path).unwrap();
    thread::sleep(SETTLE);

    let events = gather_for(&mut inotify, SETTLE);
    assert!(
        events.is_empty(),
        "expected no events after narrowing, got {:?}",
        events
    );
}

// Property: a watch only ever emits bits the caller asked for, plus
// IGNORED and ISDIR.
#[test]
fn events_stay_within_the_requested_mask() {
    let mut testdir = TestDir::new();

    let mut inotify = init();
    inotify
        .add_watch(testdir.path(), WatchMask::CREATE)
        .unwrap();

    let (path, mut file) = testdir.new_file();
    write_to(&mut file);
    fs::remove_file(&path).unwrap();
    thread::sleep(SETTLE);

    let allowed = EventMask::CREATE | EventMask::IGNORED | EventMask::ISDIR;
    for event in gather_for(&mut inotify, SETTLE) {
        assert!(
            allowed.contains(event.mask),
            "unexpected event {:?}",
            event
        );
    }
}

fn init() -> Inotify {
    let _ = env_logger::builder().is_test(true).try_init();
    Inotify::init().expect("Failed to initialize a session")
}

/// Poll the session until `done` is satisfied or the deadline passes.
fn gather<F>(inotify: &mut Inotify, mut done: F) -> Vec<EventOwned>
where
    F: FnMut(&[EventOwned]) -> bool,
{
    let mut events = Vec::new();
    let start = Instant::now();
    let mut buffer = [0; 4096];

    while !done(&events) && start.elapsed() < DEADLINE {
        for event in inotify.read_events(&mut buffer).unwrap() {
            events.push(event.to_owned());
        }
        if !done(&events) {
            thread::sleep(Duration::from_millis(25));
        }
    }
    events
}

/// Collect whatever arrives within `window`.
fn gather_for(inotify: &mut Inotify, window: Duration) -> Vec<EventOwned> {
    let mut events = Vec::new();
    let start = Instant::now();
    let mut buffer = [0; 4096];

    while start.elapsed() < window {
        for event in inotify.read_events(&mut buffer).unwrap() {
            events.push(event.to_owned());
        }
        thread::sleep(Duration::from_millis(25));
    }
    events
}

struct TestDir {
    dir: TempDir,
    counter: u32,
}

impl TestDir {
    fn new() -> TestDir {
        TestDir {
            dir: TempDir::new().unwrap(),
            counter: 0,
        }
    }

    fn path(&self) -> &std::path::Path {
        self.dir.path()
    }

    fn new_file(&mut self) -> (PathBuf, File) {
        let id = self.counter;
        self.counter += 1;

        let path = self.dir.path().join(format!("file-{}", id));
        let file = File::create(&path)
            .unwrap_or_else(|error| panic!("Failed to create temporary file: {}", error));

        (path, file)
    }
}

fn write_to(file: &mut File) {
    file.write_all(b"This should trigger a notification.")
        .unwrap_or_else(|error| panic!("Failed to write to file: {}", error));
}
