use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use block_dev::RamDisk;
use flat_fs::{Error, FileSystem, InodeState, OpenMode};

fn fresh() -> FileSystem {
    FileSystem::mkfs(Arc::new(RamDisk::new(256)), 256, 16).unwrap()
}

fn pause() {
    thread::sleep(Duration::from_millis(50));
}

#[test]
fn writers_never_overlap() {
    let fs = fresh();
    let active = AtomicUsize::new(0);

    thread::scope(|s| {
        for writer in 0..4u8 {
            let (fs, active) = (&fs, &active);
            s.spawn(move || {
                for _ in 0..10 {
                    let handle = fs.open("shared", OpenMode::Write).unwrap();
                    assert_eq!(0, active.fetch_add(1, Ordering::SeqCst));
                    fs.write(&handle, &[writer; 700]).unwrap();
                    thread::sleep(Duration::from_millis(1));
                    assert_eq!(1, active.fetch_sub(1, Ordering::SeqCst));
                    fs.close(&handle).unwrap();
                }
            });
        }
    });

    let handle = fs.open("shared", OpenMode::Read).unwrap();
    let mut buf = [0; 700];
    assert_eq!(700, fs.read(&handle, &mut buf).unwrap());
    assert!(buf.iter().all(|&byte| byte == buf[0]));
    fs.close(&handle).unwrap();

    let stat = fs.stat("shared").unwrap();
    assert_eq!((0, InodeState::Unused), (stat.open_count, stat.state));
}

#[test]
fn reader_waits_for_writer() {
    let fs = fresh();
    let opened = AtomicBool::new(false);

    let writer = fs.open("f", OpenMode::Write).unwrap();
    thread::scope(|s| {
        let reader = s.spawn(|| {
            let handle = fs.open("f", OpenMode::Read).unwrap();
            opened.store(true, Ordering::SeqCst);
            let mut buf = [0; 16];
            let len = fs.read(&handle, &mut buf).unwrap();
            fs.close(&handle).unwrap();
            buf[..len].to_vec()
        });

        pause();
        assert!(!opened.load(Ordering::SeqCst));
        fs.write(&writer, b"written").unwrap();
        fs.close(&writer).unwrap();

        assert_eq!(b"written".to_vec(), reader.join().unwrap());
    });
    assert!(opened.load(Ordering::SeqCst));
}

#[test]
fn queued_writer_holds_off_new_readers() {
    let fs = fresh();
    let first = {
        let writer = fs.open("f", OpenMode::Write).unwrap();
        fs.write(&writer, b"v1").unwrap();
        fs.close(&writer).unwrap();
        fs.open("f", OpenMode::Read).unwrap()
    };

    thread::scope(|s| {
        let writer = s.spawn(|| {
            let handle = fs.open("f", OpenMode::Write).unwrap();
            fs.write(&handle, b"v2").unwrap();
            fs.close(&handle).unwrap();
        });

        pause();
        assert_eq!(
            InodeState::ReadLockedPendingWriters,
            fs.stat("f").unwrap().state
        );
        // 有写者排队，新的读者进不来
        assert!(matches!(
            fs.open_timeout("f", OpenMode::Read, Duration::from_millis(20)),
            Err(Error::TimedOut)
        ));

        fs.close(&first).unwrap();
        writer.join().unwrap();
    });

    let handle = fs.open("f", OpenMode::Read).unwrap();
    let mut buf = [0; 4];
    assert_eq!(2, fs.read(&handle, &mut buf).unwrap());
    assert_eq!(b"v2", &buf[..2]);
    fs.close(&handle).unwrap();
}

#[test]
fn open_timeout_gives_up() {
    let fs = fresh();
    let writer = fs.open("f", OpenMode::Write).unwrap();

    for mode in [OpenMode::Read, OpenMode::Write, OpenMode::Append] {
        assert!(matches!(
            fs.open_timeout("f", mode, Duration::from_millis(20)),
            Err(Error::TimedOut)
        ));
    }
    // 放弃等待的写者撤去了排队标记
    assert_eq!(InodeState::WriteLocked, fs.stat("f").unwrap().state);
    assert_eq!(1, fs.open_handles());

    fs.close(&writer).unwrap();
    let reader = fs
        .open_timeout("f", OpenMode::Read, Duration::from_millis(20))
        .unwrap();
    fs.close(&reader).unwrap();
}

#[test]
fn format_waits_for_open_handles() {
    let fs = fresh();
    let formatted = AtomicBool::new(false);
    let handle = fs.open("f", OpenMode::Write).unwrap();

    thread::scope(|s| {
        s.spawn(|| {
            fs.format(8).unwrap();
            formatted.store(true, Ordering::SeqCst);
        });

        pause();
        assert!(!formatted.load(Ordering::SeqCst));
        fs.write(&handle, b"still usable").unwrap();
        fs.close(&handle).unwrap();
    });

    assert!(formatted.load(Ordering::SeqCst));
    assert_eq!(1, fs.list().len());
    assert_eq!(8, fs.super_block().total_inodes);
}

#[test]
fn different_files_in_parallel() {
    let fs = fresh();

    thread::scope(|s| {
        for id in 0..4u8 {
            let fs = &fs;
            s.spawn(move || {
                let name = format!("file{id}");
                let data = vec![id; 3000];
                let handle = fs.open(&name, OpenMode::Write).unwrap();
                fs.write(&handle, &data).unwrap();
                fs.close(&handle).unwrap();

                let handle = fs.open(&name, OpenMode::Read).unwrap();
                let mut buf = vec![0; 3000];
                assert_eq!(3000, fs.read(&handle, &mut buf).unwrap());
                assert_eq!(data, buf);
                fs.close(&handle).unwrap();
            });
        }
    });

    assert_eq!(5, fs.list().len());
}
