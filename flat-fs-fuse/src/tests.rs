use std::path::PathBuf;
use std::{fs, process};

use flat_fs::Error;

use super::*;

/// 每个测试独占一个临时目录
fn scratch(test: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("flat-fs-fuse-{}-{test}", process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn block_file_round_trip() {
    let dir = scratch("block-file");
    let block_file = BlockFile::create(&dir.join("fs.img"), 4).unwrap();

    let block = [0x5A; BLOCK_SIZE];
    block_file.write_block(3, &block).unwrap();
    let mut buf = [0; BLOCK_SIZE];
    block_file.read_block(3, &mut buf).unwrap();
    assert_eq!(block, buf);

    assert!(matches!(
        block_file.read_block(4, &mut buf),
        Err(DeviceError::OutOfRange { block_id: 4 })
    ));
    assert!(matches!(
        block_file.write_block(0, &block[..10]),
        Err(DeviceError::ShortTransfer { len: 10, .. })
    ));

    fs::remove_dir_all(dir).unwrap();
}

#[test]
fn image_survives_remount() {
    let dir = scratch("remount");
    let image = dir.join("fs.img");

    {
        let fs = format_image(&image, 256, 16).unwrap();
        write_file(&fs, "hello.txt", b"hello, flat-fs").unwrap();
        fs.sync().unwrap();
    }

    let fs = mount_image(&image).unwrap();
    assert_eq!(b"hello, flat-fs".to_vec(), read_file(&fs, "hello.txt").unwrap());
    assert!(matches!(read_file(&fs, "missing"), Err(Error::NotFound)));

    fs::remove_dir_all(dir).unwrap();
}

#[test]
fn pack_copies_regular_files() {
    let dir = scratch("pack");
    let source = dir.join("source");
    fs::create_dir_all(source.join("nested")).unwrap();
    fs::write(source.join("a.bin"), vec![7; 3000]).unwrap();
    fs::write(source.join("b.txt"), "bee").unwrap();
    fs::write(source.join("nested").join("skipped"), "x").unwrap();

    let image = dir.join("fs.img");
    let fs = format_image(&image, 256, 16).unwrap();
    assert_eq!(vec!["a.bin", "b.txt"], pack(&fs, &source).unwrap());
    drop(fs);

    let fs = mount_image(&image).unwrap();
    assert_eq!(vec![7; 3000], read_file(&fs, "a.bin").unwrap());
    assert_eq!(b"bee".to_vec(), read_file(&fs, "b.txt").unwrap());
    assert_eq!(3, fs.list().len());

    fs::remove_dir_all(dir).unwrap();
}

#[test]
fn pack_reports_missing_source() {
    let dir = scratch("pack-missing");
    let fs = format_image(&dir.join("fs.img"), 64, 16).unwrap();

    let missing = dir.join("absent");
    match pack(&fs, &missing) {
        Err(PackError::Host { path, source }) => {
            assert_eq!(missing, path);
            assert_eq!(io::ErrorKind::NotFound, source.kind());
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(1, fs.list().len());

    fs::remove_dir_all(dir).unwrap();
}

#[test]
fn plain_file_is_not_a_volume() {
    let dir = scratch("blank");
    let image = dir.join("fs.img");
    BlockFile::create(&image, 8).unwrap();

    assert!(matches!(mount_image(&image), Err(Error::Unformatted)));
    assert!(matches!(
        mount_image(&dir.join("absent.img")),
        Err(Error::Device(DeviceError::Io(_)))
    ));

    fs::remove_dir_all(dir).unwrap();
}
