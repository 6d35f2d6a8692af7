//! End-to-end farm scenarios: a Park over the in-memory filesystem, driven
//! from one or more Ref threads.

use std::sync::Arc;
use wasi_farm::{
    Errno, FarmConfig, FarmPark, FarmRef, FdEntry, FdFlags, FileType, Iovec, LookupFlags, OFlags,
    Rights, VirtDir, Whence,
};

fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn hello_park(config: FarmConfig) -> FarmPark {
    trace_init();
    let root = VirtDir::new();
    root.put_file("hello.txt", b"Hello, world!").unwrap();
    FarmPark::spawn(vec![FdEntry::preopen(Arc::new(root), ".")], config).unwrap()
}

fn open(farm: &FarmRef, dirfd: u32, path: &str, oflags: OFlags, fdflags: FdFlags) -> u32 {
    farm.path_open(
        dirfd,
        LookupFlags::empty(),
        path,
        oflags,
        Rights::FD_READ | Rights::FD_WRITE,
        Rights::empty(),
        fdflags,
    )
    .unwrap()
}

fn read_all(farm: &FarmRef, fd: u32, len: u32) -> Vec<u8> {
    let (nread, data) = farm
        .fd_read(fd, &[Iovec { buf: 0, buf_len: len }])
        .unwrap();
    assert_eq!(nread as usize, data.len());
    data
}

#[test]
fn open_read_close_scenario() {
    let park = hello_park(FarmConfig::default());
    let farm = park.handle();

    let fd = open(&farm, 0, "hello.txt", OFlags::empty(), FdFlags::empty());
    assert_eq!(fd, 1);
    assert_eq!(read_all(&farm, fd, 13), b"Hello, world!");

    farm.fd_close(fd).unwrap();
    assert_eq!(
        farm.fd_read(fd, &[Iovec { buf: 0, buf_len: 1 }]),
        Err(Errno::Badf)
    );
    // Closing again is Badf, and the slot's dispatch loop survives it.
    assert_eq!(farm.fd_close(fd), Err(Errno::Badf));

    let again = open(&farm, 0, "hello.txt", OFlags::empty(), FdFlags::empty());
    assert_eq!(again, 2);
    assert_eq!(read_all(&farm, again, 13), b"Hello, world!");
}

#[test]
fn write_read_round_trips() {
    let park = hello_park(FarmConfig::default());
    let farm = park.handle();
    for n in [0usize, 1, 4096] {
        let fd = open(&farm, 0, "scratch", OFlags::CREATE, FdFlags::empty());
        let data: Vec<u8> = (0..n).map(|i| (i % 251) as u8).collect();
        assert_eq!(farm.fd_write(fd, &data).unwrap() as usize, n);
        assert_eq!(farm.fd_seek(fd, 0, Whence::Set).unwrap(), 0);
        assert_eq!(read_all(&farm, fd, n as u32), data);
        farm.fd_close(fd).unwrap();
        farm.path_unlink_file(0, "scratch").unwrap();
    }
}

#[test]
fn round_trip_at_arena_capacity() {
    let config = FarmConfig::default().arena_bytes(4096);
    let park = hello_park(config);
    let farm = park.handle();
    let fd = open(&farm, 0, "big", OFlags::CREATE, FdFlags::empty());

    // The arena header occupies 12 bytes; everything else is payload room.
    let room = 4096 - 12;
    let data: Vec<u8> = (0..room - 1).map(|i| (i % 13) as u8).collect();
    assert_eq!(farm.fd_write(fd, &data).unwrap() as usize, data.len());
    assert_eq!(farm.fd_seek(fd, 0, Whence::Set).unwrap(), 0);
    assert_eq!(read_all(&farm, fd, data.len() as u32), data);
}

#[test]
fn payload_over_arena_capacity_is_refused() {
    let config = FarmConfig::default().arena_bytes(4096);
    let park = hello_park(config);
    let farm = park.handle();
    let fd = open(&farm, 0, "big", OFlags::CREATE, FdFlags::empty());

    let room = 4096 - 12;
    assert_eq!(farm.fd_write(fd, &vec![0u8; room]).unwrap() as usize, room);
    assert_eq!(farm.fd_write(fd, &vec![0u8; room + 1]), Err(Errno::Nomem));
    // The failed staging did not wedge the arena.
    assert_eq!(farm.fd_write(fd, b"ok").unwrap(), 2);
}

#[test]
fn concurrent_writers_never_interleave_frames() {
    let park = hello_park(FarmConfig::default());
    let farm = park.handle();
    let fd = open(&farm, 0, "log", OFlags::CREATE, FdFlags::APPEND);

    const BLOCK: usize = 64;
    const ROUNDS: usize = 100;
    std::thread::scope(|s| {
        for fill in [b'a', b'b'] {
            let farm = farm.clone();
            s.spawn(move || {
                let block = [fill; BLOCK];
                for _ in 0..ROUNDS {
                    assert_eq!(farm.fd_write(fd, &block).unwrap() as usize, BLOCK);
                }
            });
        }
    });

    let check = open(&farm, 0, "log", OFlags::empty(), FdFlags::empty());
    let (nread, data) = farm
        .fd_pread(
            check,
            &[Iovec {
                buf: 0,
                buf_len: (2 * ROUNDS * BLOCK) as u32,
            }],
            0,
        )
        .unwrap();
    assert_eq!(nread as usize, 2 * ROUNDS * BLOCK);
    // Per-fd mutual exclusion means every block is uniform.
    for block in data.chunks(BLOCK) {
        assert!(block.iter().all(|&b| b == block[0]));
    }
}

#[test]
fn rename_storm_terminates() {
    trace_init();
    let dir_a = VirtDir::new();
    let dir_b = VirtDir::new();
    dir_a.put_file("ping", b"ping").unwrap();
    dir_b.put_file("pong", b"pong").unwrap();
    let park = FarmPark::spawn(
        vec![
            FdEntry::preopen(Arc::new(dir_a), "a"),
            FdEntry::preopen(Arc::new(dir_b), "b"),
        ],
        FarmConfig::default(),
    )
    .unwrap();
    let farm = park.handle();

    // Opposite lock orders, many times over: the ascending-index acquisition
    // must never deadlock the pair.
    std::thread::scope(|s| {
        let f1 = farm.clone();
        s.spawn(move || {
            for _ in 0..1000 {
                let _ = f1.path_rename(0, "ping", 1, "ping");
                let _ = f1.path_rename(1, "ping", 0, "ping");
            }
        });
        let f2 = farm.clone();
        s.spawn(move || {
            for _ in 0..1000 {
                let _ = f2.path_rename(1, "pong", 0, "pong");
                let _ = f2.path_rename(0, "pong", 1, "pong");
            }
        });
    });
}

#[test]
fn renumber_moves_the_descriptor() {
    let park = hello_park(FarmConfig::default());
    let farm = park.handle();
    let root = 0;
    let a = open(&farm, root, "a.txt", OFlags::CREATE, FdFlags::empty());
    let b = open(&farm, root, "b.txt", OFlags::CREATE, FdFlags::empty());
    farm.fd_write(a, b"from a").unwrap();
    farm.fd_write(b, b"from b").unwrap();

    farm.fd_renumber(a, b).unwrap();
    assert_eq!(farm.fd_tell(a), Err(Errno::Badf));
    // Slot b now carries a's open file, position included.
    assert_eq!(farm.fd_tell(b).unwrap(), 6);
    let (_, data) = farm.fd_pread(b, &[Iovec { buf: 0, buf_len: 6 }], 0).unwrap();
    assert_eq!(data, b"from a");
}

#[test]
fn close_is_broadcast_to_registered_refs() {
    let park = hello_park(FarmConfig::default());
    let farm_a = park.handle();
    let farm_b = park.handle();

    let fd = open(&farm_a, 0, "hello.txt", OFlags::empty(), FdFlags::empty());
    let id_a = farm_a.register(&[0, fd]).unwrap();
    let id_b = farm_b.register(&[0, fd]).unwrap();
    let id_c = farm_b.register(&[0]).unwrap();

    farm_a.fd_close(fd).unwrap();

    assert_eq!(farm_a.take_closed_fds(id_a), vec![fd]);
    assert_eq!(farm_a.take_closed_fds(id_a), Vec::<u32>::new());
    assert_eq!(farm_b.take_closed_fds(id_b), vec![fd]);
    // A Ref that never held the fd hears nothing.
    assert_eq!(farm_b.take_closed_fds(id_c), Vec::<u32>::new());
}

#[test]
fn prestat_advertises_the_preopen() {
    let park = hello_park(FarmConfig::default());
    let farm = park.handle();
    let prestat = farm.fd_prestat_get(0).unwrap();
    assert_eq!(prestat.name_len, 1);
    assert_eq!(farm.fd_prestat_dir_name(0, prestat.name_len).unwrap(), b".");
    assert_eq!(farm.fd_prestat_dir_name(0, 0), Err(Errno::Nametoolong));
    // Non-preopen descriptors have no prestat.
    let fd = open(&farm, 0, "hello.txt", OFlags::empty(), FdFlags::empty());
    assert_eq!(farm.fd_prestat_get(fd), Err(Errno::Badf));
}

#[test]
fn readdir_lists_the_preopen() {
    let park = hello_park(FarmConfig::default());
    let farm = park.handle();
    let (buf, used) = farm.fd_readdir(0, 4096, 0).unwrap();
    assert_eq!(used as usize, buf.len());

    let mut names = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        let namlen =
            u32::from_le_bytes([buf[offset + 16], buf[offset + 17], buf[offset + 18], buf[offset + 19]])
                as usize;
        names.push(String::from_utf8(buf[offset + 24..offset + 24 + namlen].to_vec()).unwrap());
        offset += 24 + namlen;
    }
    assert_eq!(names, vec![".", "..", "hello.txt"]);
}

#[test]
fn readdir_reports_full_buffer_when_truncated() {
    let park = hello_park(FarmConfig::default());
    let farm = park.handle();
    // Too small for even the "." entry: the buffer comes back brim-full.
    let (buf, used) = farm.fd_readdir(0, 16, 0).unwrap();
    assert_eq!(used, 16);
    assert_eq!(buf.len(), 16);
}

#[test]
fn fdstat_and_filestat_surface_capability_answers() {
    let park = hello_park(FarmConfig::default());
    let farm = park.handle();
    let fdstat = farm.fd_fdstat_get(0).unwrap();
    assert_eq!(fdstat.filetype, FileType::Directory);
    assert!(fdstat.rights_base.contains(Rights::PATH_OPEN));

    let fd = open(&farm, 0, "hello.txt", OFlags::empty(), FdFlags::empty());
    let stat = farm.fd_filestat_get(fd).unwrap();
    assert_eq!(stat.filetype, FileType::RegularFile);
    assert_eq!(stat.size, 13);

    let by_path = farm
        .path_filestat_get(0, LookupFlags::empty(), "hello.txt")
        .unwrap();
    assert_eq!(by_path.inode, stat.inode);
}

#[test]
fn symlinks_are_not_supported() {
    let park = hello_park(FarmConfig::default());
    let farm = park.handle();
    assert_eq!(
        farm.path_symlink("hello.txt", 0, "link"),
        Err(Errno::Notsup)
    );
    // The refusal must not leak the staged paths: the arena still serves.
    assert_eq!(read_all(
        &farm,
        open(&farm, 0, "hello.txt", OFlags::empty(), FdFlags::empty()),
        13
    ), b"Hello, world!");
}

#[test]
fn freshly_opened_fd_is_addressable_from_another_thread() {
    let park = hello_park(FarmConfig::default());
    let farm = park.handle();
    for _ in 0..50 {
        let fd = open(&farm, 0, "hello.txt", OFlags::empty(), FdFlags::empty());
        let other = farm.clone();
        std::thread::scope(|s| {
            s.spawn(move || {
                let (nread, data) = other
                    .fd_pread(fd, &[Iovec { buf: 0, buf_len: 5 }], 0)
                    .unwrap();
                assert_eq!((nread, data.as_slice()), (5, &b"Hello"[..]));
            });
        });
        farm.fd_close(fd).unwrap();
    }
}

#[test]
fn seek_and_tell_track_the_cursor() {
    let park = hello_park(FarmConfig::default());
    let farm = park.handle();
    let fd = open(&farm, 0, "hello.txt", OFlags::empty(), FdFlags::empty());
    assert_eq!(farm.fd_seek(fd, -6, Whence::End).unwrap(), 7);
    assert_eq!(farm.fd_tell(fd).unwrap(), 7);
    assert_eq!(read_all(&farm, fd, 6), b"world!");
    assert_eq!(farm.fd_seek(fd, -100, Whence::Cur), Err(Errno::Inval));
}

#[test]
fn directory_tree_operations_round_trip() {
    let park = hello_park(FarmConfig::default());
    let farm = park.handle();
    farm.path_create_directory(0, "nest").unwrap();
    let fd = open(&farm, 0, "nest/egg", OFlags::CREATE, FdFlags::empty());
    farm.fd_write(fd, b"yolk").unwrap();
    farm.fd_close(fd).unwrap();

    farm.path_link(0, LookupFlags::empty(), "nest/egg", 0, "egg2")
        .unwrap();
    let linked = open(&farm, 0, "egg2", OFlags::empty(), FdFlags::empty());
    assert_eq!(read_all(&farm, linked, 4), b"yolk");

    assert_eq!(
        farm.path_remove_directory(0, "nest"),
        Err(Errno::Notempty)
    );
    farm.path_unlink_file(0, "nest/egg").unwrap();
    farm.path_remove_directory(0, "nest").unwrap();
    assert_eq!(
        farm.path_filestat_get(0, LookupFlags::empty(), "nest"),
        Err(Errno::Noent)
    );
}
