use std::fs::File;
use std::os::unix::fs::FileExt;

use vhd_aio::format::{
    self, encode_locator, read_footer, read_header, read_parent_path, CreateOpts, DynamicHeader,
    Footer, Geometry, ParentLocator, VhdType, DD_BLK_UNUSED, PLAT_CODE_MACX, PLAT_CODE_W2KU,
};
use vhd_aio::{VhdError, SECTOR_SIZE};

#[test]
fn footer_round_trip_is_byte_identical() {
    let footer = Footer::new(VhdType::Dynamic, 8 * 1024 * 1024, 512);
    let bytes = footer.to_bytes();
    let parsed = Footer::parse(&bytes).expect("valid footer");
    assert_eq!(parsed.to_bytes(), bytes);
    assert_eq!(parsed.current_size, 8 * 1024 * 1024);
    assert_eq!(parsed.disk_type, VhdType::Dynamic);
    assert_eq!(parsed.uuid, footer.uuid);
    assert_eq!(parsed.geometry, footer.geometry);
}

#[test]
fn footer_checksum_corruption_is_detected() {
    let footer = Footer::new(VhdType::Fixed, 1024 * 1024, u64::MAX);
    let good = footer.to_bytes();
    assert!(Footer::parse(&good).is_ok());

    // Any single-bit flip of the stored checksum must be caught.
    for byte in 64..68 {
        for bit in 0..8 {
            let mut bad = good;
            bad[byte] ^= 1 << bit;
            assert!(
                matches!(Footer::parse(&bad), Err(VhdError::Corrupt(_))),
                "flip of byte {byte} bit {bit} went undetected"
            );
        }
    }

    // A flipped payload byte fails the checksum too.
    let mut bad = good;
    bad[48] ^= 0x01;
    assert!(Footer::parse(&bad).is_err());
}

#[test]
fn footer_rejects_bad_cookie_and_version() {
    let footer = Footer::new(VhdType::Dynamic, 1024 * 1024, 512);
    let mut raw = footer.to_bytes();
    raw[0] = b'x';
    assert!(matches!(Footer::parse(&raw), Err(VhdError::Corrupt(_))));

    let mut raw = footer.to_bytes();
    raw[12..16].copy_from_slice(&0x0002_0000u32.to_be_bytes());
    // Re-checksum so the version check is what trips.
    let sum = format::checksum(&raw, 64..68);
    raw[64..68].copy_from_slice(&sum.to_be_bytes());
    assert!(matches!(Footer::parse(&raw), Err(VhdError::Unsupported(_))));
}

#[test]
fn header_round_trip_is_byte_identical() {
    let mut hdr = DynamicHeader::new(1536, 64, 2 * 1024 * 1024);
    hdr.prt_uuid = uuid_like();
    hdr.prt_ts = 123_456;
    hdr.prt_name = "base.vhd".to_string();
    hdr.locators[0] = ParentLocator {
        code: PLAT_CODE_MACX,
        data_space: 1,
        data_length: 20,
        data_offset: 4096,
    };

    let bytes = hdr.to_bytes();
    let parsed = DynamicHeader::parse(&bytes).expect("valid header");
    assert_eq!(parsed.to_bytes(), bytes);
    assert_eq!(parsed.prt_name, "base.vhd");
    assert_eq!(parsed.prt_uuid, hdr.prt_uuid);
    assert_eq!(parsed.locators[0], hdr.locators[0]);
    assert!(!parsed.locators[1].is_present());
}

fn uuid_like() -> uuid::Uuid {
    uuid::Uuid::from_bytes([
        0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff,
        0x00,
    ])
}

#[test]
fn header_checksum_corruption_is_detected() {
    let hdr = DynamicHeader::new(1536, 16, 2 * 1024 * 1024);
    let mut raw = hdr.to_bytes();
    raw[36] ^= 0x80;
    assert!(matches!(
        DynamicHeader::parse(&raw),
        Err(VhdError::Corrupt(_))
    ));
}

#[test]
fn w2ku_locator_strips_drive_and_maps_slashes() {
    // A Windows-style path as another implementation would record it.
    let mut data = Vec::new();
    for unit in r"C:\images\base.vhd".encode_utf16() {
        data.extend_from_slice(&unit.to_le_bytes());
    }
    let decoded = format::decode_locator(PLAT_CODE_W2KU, &data).expect("w2ku decodes");
    assert_eq!(decoded, "/images/base.vhd");

    // Our own encoding round-trips unchanged.
    let encoded = encode_locator(PLAT_CODE_W2KU, "/images/base.vhd").unwrap();
    assert_eq!(
        format::decode_locator(PLAT_CODE_W2KU, &encoded).unwrap(),
        "/images/base.vhd"
    );
}

#[test]
fn macx_locator_round_trips_as_file_uri() {
    let encoded = encode_locator(PLAT_CODE_MACX, "/images/base.vhd").unwrap();
    assert!(encoded.starts_with(b"file://"));
    assert_eq!(
        format::decode_locator(PLAT_CODE_MACX, &encoded).unwrap(),
        "/images/base.vhd"
    );
}

#[test]
fn unknown_locator_codes_are_ignored() {
    assert!(format::decode_locator(0, b"whatever").is_none());
    assert!(format::decode_locator(u32::from_be_bytes(*b"Wi2r"), b"x").is_none());
}

#[test]
fn locator_capacity_accepts_sectors_or_bytes() {
    let sectors = ParentLocator {
        code: PLAT_CODE_W2KU,
        data_space: 1,
        data_length: 40,
        data_offset: 0,
    };
    assert_eq!(sectors.capacity_bytes(), 512);

    let bytes = ParentLocator {
        code: PLAT_CODE_W2KU,
        data_space: 512,
        data_length: 40,
        data_offset: 0,
    };
    assert_eq!(bytes.capacity_bytes(), 512);
}

#[test]
fn geometry_is_sane_across_sizes() {
    for secs in [1u64, 4096, 65536, 1 << 22, 1 << 28] {
        let g = Geometry::for_sectors(secs);
        assert!(g.heads >= 4 && g.heads <= 16, "heads for {secs}");
        assert!(g.sectors_per_track > 0);
        let capacity =
            g.cylinders as u64 * g.heads as u64 * g.sectors_per_track as u64;
        assert!(capacity <= secs.max(1), "geometry overshoots for {secs}");
    }
}

#[test]
fn vhd_time_counts_from_2000() {
    let t = std::time::UNIX_EPOCH + std::time::Duration::from_secs(946_684_800 + 100);
    assert_eq!(format::vhd_time(t), 100);
}

#[test]
fn created_dynamic_image_has_coherent_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.vhd");
    format::create(&path, 16 * 1024 * 1024, &CreateOpts { sparse: true, backing: None }).unwrap();

    let file = File::open(&path).unwrap();
    let footer = read_footer(&file).unwrap();
    assert_eq!(footer.disk_type, VhdType::Dynamic);
    assert_eq!(footer.current_size, 16 * 1024 * 1024);

    // Backup footer at byte 0 matches the EOF copy.
    let len = file.metadata().unwrap().len();
    let mut eof_copy = [0u8; SECTOR_SIZE];
    let mut backup = [0u8; SECTOR_SIZE];
    file.read_exact_at(&mut eof_copy, len - SECTOR_SIZE as u64).unwrap();
    file.read_exact_at(&mut backup, 0).unwrap();
    assert_eq!(eof_copy, backup);

    let hdr = read_header(&file, footer.data_offset).unwrap();
    assert_eq!(hdr.block_size, 2 * 1024 * 1024);
    assert_eq!(hdr.max_bat_size, 8);

    // Every BAT entry starts unused.
    let mut bat = vec![0u8; hdr.max_bat_size as usize * 4];
    file.read_exact_at(&mut bat, hdr.table_offset).unwrap();
    for entry in bat.chunks_exact(4) {
        assert_eq!(u32::from_be_bytes(entry.try_into().unwrap()), DD_BLK_UNUSED);
    }
}

#[test]
fn create_rejects_unaligned_or_zero_size() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.vhd");
    let opts = CreateOpts { sparse: true, backing: None };
    assert!(matches!(
        format::create(&path, 0, &opts),
        Err(VhdError::InvalidArg)
    ));
    assert!(matches!(
        format::create(&path, 1000, &opts),
        Err(VhdError::InvalidArg)
    ));
}

#[test]
fn snapshot_records_parent_identity() {
    let dir = tempfile::tempdir().unwrap();
    let parent = dir.path().join("parent.vhd");
    let child = dir.path().join("child.vhd");
    format::create(&parent, 8 * 1024 * 1024, &CreateOpts { sparse: true, backing: None })
        .unwrap();
    format::snapshot(&parent, &child).unwrap();

    let parent_file = File::open(&parent).unwrap();
    let parent_footer = read_footer(&parent_file).unwrap();

    let child_file = File::open(&child).unwrap();
    let child_footer = read_footer(&child_file).unwrap();
    assert_eq!(child_footer.disk_type, VhdType::Diff);
    assert_eq!(child_footer.current_size, parent_footer.current_size);

    let hdr = read_header(&child_file, child_footer.data_offset).unwrap();
    assert_eq!(hdr.prt_uuid, parent_footer.uuid);

    let recorded = read_parent_path(&child_file, &hdr).unwrap().expect("has parent");
    assert_eq!(recorded, parent.to_string_lossy());

    format::validate_parent(&child, &parent).unwrap();

    // A different image is not an acceptable parent.
    let stranger = dir.path().join("stranger.vhd");
    format::create(&stranger, 8 * 1024 * 1024, &CreateOpts { sparse: true, backing: None })
        .unwrap();
    assert!(matches!(
        format::validate_parent(&child, &stranger),
        Err(VhdError::ParentMismatch(_))
    ));
}
