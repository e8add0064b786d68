//! Fixture builders shared by the per-module tests.
//!
//! Archives are synthesized with the same primitives the decoder uses, the
//! way a mock BAR is encrypted with the production cipher before being read
//! back. All layout constants mirror the builders below; tests assert the
//! decoder recovers exactly what was put in.

use byteorder::{LittleEndian, WriteBytesExt};

use nxk_secure::aes::{
    ctr_apply, ecb_encrypt_key_area, section_counter, xts_encrypt, XTS_SECTOR_SIZE,
};
use nxk_secure::hash::sha256;

use crate::keys::{KaekIndex, KeySet};
use crate::nca::structs::{FS_HEADER_SIZE, MEDIA_UNIT, NCA_HEADER_SIZE, SECTION_COUNT};
use crate::nca::{ContentArchive, OpenOptions};
use crate::storage::{ContentId, MemoryStorage};
use crate::Result;

pub(crate) const HEADER_DATA_KEY: [u8; 16] = [0x70; 16];
pub(crate) const HEADER_TWEAK_KEY: [u8; 16] = [0x71; 16];
pub(crate) const KAEK: [u8; 16] = [0x4B; 16];
pub(crate) const TITLEKEK: [u8; 16] = [0x42; 16];

/// Plaintext key area every fixture uses: XTS halves, CTR key, spare.
pub(crate) const KEY_AREA: [[u8; 16]; 4] = [[0xA0; 16], [0xA1; 16], [0xA2; 16], [0xA3; 16]];

pub(crate) const TEST_CONTENT_ID: ContentId = ContentId([0x01; 16]);

pub(crate) fn test_keys() -> KeySet {
    let mut keys = KeySet::new();
    let mut header_key = [0u8; 32];
    header_key[..16].copy_from_slice(&HEADER_DATA_KEY);
    header_key[16..].copy_from_slice(&HEADER_TWEAK_KEY);
    keys.set_header_key(header_key);
    keys.set_application_key(KaekIndex::Application, 0, KAEK);
    keys.set_titlekey_kek(0, TITLEKEK);
    keys
}

/// One section of a fixture archive.
pub(crate) struct SectionSpec {
    pub media_start: u32,
    pub media_end: u32,
    /// 0x200 bytes of plaintext FS header.
    pub fs_header: Vec<u8>,
    /// Ciphertext placed at `media_start * 0x200`.
    pub body: Vec<u8>,
}

/// Assemble and header-encrypt a complete NCA3 image.
pub(crate) fn build_nca(specs: &[Option<SectionSpec>], title_id: u64, rights_id: [u8; 16]) -> Vec<u8> {
    build_nca_v(specs, title_id, rights_id, b"NCA3")
}

/// [`build_nca`] with an explicit magic. `NCA2` switches the FS headers to
/// per-header sector-0 encryption.
pub(crate) fn build_nca_v(
    specs: &[Option<SectionSpec>],
    title_id: u64,
    rights_id: [u8; 16],
    magic: &[u8; 4],
) -> Vec<u8> {
    assert!(specs.len() <= SECTION_COUNT);

    let mut total_media = (NCA_HEADER_SIZE as u64 / MEDIA_UNIT) as u32;
    for spec in specs.iter().flatten() {
        total_media = total_media.max(spec.media_end).max(
            spec.media_start + ((spec.body.len() as u64).div_ceil(MEDIA_UNIT)) as u32,
        );
    }
    let nca_size = u64::from(total_media) * MEDIA_UNIT;

    // Plaintext header region.
    let mut header = vec![0u8; NCA_HEADER_SIZE];
    header[0x200..0x204].copy_from_slice(magic);
    header[0x204] = 0; // distribution: download
    header[0x205] = 0; // content type: program
    header[0x206] = 0; // crypto_type
    header[0x207] = 0; // kaek index: application
    header[0x208..0x210].copy_from_slice(&nca_size.to_le_bytes());
    header[0x210..0x218].copy_from_slice(&title_id.to_le_bytes());
    header[0x21C..0x220].copy_from_slice(&0x000C_1100u32.to_le_bytes());
    header[0x220] = 0; // crypto_type2
    header[0x230..0x240].copy_from_slice(&rights_id);

    for (i, spec) in specs.iter().enumerate() {
        let entry = 0x240 + i * 0x10;
        if let Some(spec) = spec {
            header[entry..entry + 4].copy_from_slice(&spec.media_start.to_le_bytes());
            header[entry + 4..entry + 8].copy_from_slice(&spec.media_end.to_le_bytes());

            assert_eq!(spec.fs_header.len(), FS_HEADER_SIZE);
            let fs_start = 0x400 + i * FS_HEADER_SIZE;
            header[fs_start..fs_start + FS_HEADER_SIZE].copy_from_slice(&spec.fs_header);
            if spec.media_end > spec.media_start {
                let hash_start = 0x280 + i * 0x20;
                header[hash_start..hash_start + 0x20].copy_from_slice(&sha256(&spec.fs_header));
            }
        }
    }

    let mut key_area = KEY_AREA;
    if rights_id.iter().all(|&b| b == 0) {
        ecb_encrypt_key_area(&KAEK, &mut key_area);
    } else {
        key_area = [[0u8; 16]; 4];
    }
    for (i, key) in key_area.iter().enumerate() {
        let start = 0x300 + i * 0x10;
        header[start..start + 0x10].copy_from_slice(key);
    }

    // Header encryption: main header as sectors 0-1, FS headers as 2-5.
    xts_encrypt(
        &HEADER_DATA_KEY,
        &HEADER_TWEAK_KEY,
        &mut header[..0x400],
        XTS_SECTOR_SIZE,
        0,
    );
    for i in 0..SECTION_COUNT {
        let start = 0x400 + i * FS_HEADER_SIZE;
        let first_sector = if magic == b"NCA2" { 0 } else { (2 + i) as u128 };
        xts_encrypt(
            &HEADER_DATA_KEY,
            &HEADER_TWEAK_KEY,
            &mut header[start..start + FS_HEADER_SIZE],
            XTS_SECTOR_SIZE,
            first_sector,
        );
    }

    let mut nca = vec![0u8; nca_size as usize];
    nca[..NCA_HEADER_SIZE].copy_from_slice(&header);
    for spec in specs.iter().flatten() {
        let start = u64::from(spec.media_start) * MEDIA_UNIT;
        nca[start as usize..start as usize + spec.body.len()].copy_from_slice(&spec.body);
    }
    nca
}

pub(crate) fn open_fixture(nca: Vec<u8>) -> ContentArchive<MemoryStorage> {
    try_open_fixture(nca).expect("fixture archive must open")
}

pub(crate) fn try_open_fixture(nca: Vec<u8>) -> Result<ContentArchive<MemoryStorage>> {
    let mut storage = MemoryStorage::new();
    storage.insert(TEST_CONTENT_ID, nca);
    ContentArchive::open(storage, TEST_CONTENT_ID, &test_keys(), OpenOptions::new())
}

pub(crate) fn try_open_fixture_with(
    nca: Vec<u8>,
    keys: &KeySet,
    options: OpenOptions<'_>,
) -> Result<ContentArchive<MemoryStorage>> {
    let mut storage = MemoryStorage::new();
    storage.insert(TEST_CONTENT_ID, nca);
    ContentArchive::open(storage, TEST_CONTENT_ID, keys, options)
}

pub(crate) const SECTION_CTR_HIGH: u32 = 0x0102_0304;
pub(crate) const SECTION_CTR_LOW: u32 = 0x0506_0708;
pub(crate) const PFS0_BLOCK_SIZE: u32 = 0x400;
pub(crate) const PFS0_IMAGE_OFFSET: u64 = 0x400;
pub(crate) const PFS0_MEDIA_START: u32 = 6;

/// Full NCA3 with section 0 = CTR-encrypted PFS0 (the scenario archive:
/// section 0 spans media 6..1024, section 1 is a degenerate entry).
pub(crate) fn pfs0_fixture(entries: &[(&str, &[u8])]) -> Vec<u8> {
    pfs0_fixture_keyed(entries, &KEY_AREA[2], [0u8; 16])
}

/// [`pfs0_fixture`] with an explicit section key and rights ID.
pub(crate) fn pfs0_fixture_keyed(
    entries: &[(&str, &[u8])],
    section_key: &[u8; 16],
    rights_id: [u8; 16],
) -> Vec<u8> {
    let image = build_pfs0_image(entries);
    let (master, table) = sha256_hash_table(&image, PFS0_BLOCK_SIZE);
    assert!(table.len() as u64 <= PFS0_IMAGE_OFFSET);

    let mut plain = table.clone();
    plain.resize(PFS0_IMAGE_OFFSET as usize, 0);
    plain.extend_from_slice(&image);
    let padded = plain.len().div_ceil(MEDIA_UNIT as usize) * MEDIA_UNIT as usize;
    plain.resize(padded, 0);

    let nca_offset = u64::from(PFS0_MEDIA_START) * MEDIA_UNIT;
    let body = ctr_encrypt_body(
        &plain,
        section_key,
        SECTION_CTR_HIGH,
        SECTION_CTR_LOW,
        nca_offset,
    );
    let fs_header = fs_header_pfs0(
        &master,
        PFS0_BLOCK_SIZE,
        0,
        table.len() as u64,
        PFS0_IMAGE_OFFSET,
        image.len() as u64,
        SECTION_CTR_LOW,
        SECTION_CTR_HIGH,
    );

    build_nca(
        &[
            Some(SectionSpec {
                media_start: PFS0_MEDIA_START,
                media_end: 1024,
                fs_header,
                body,
            }),
            Some(SectionSpec {
                media_start: 1024,
                media_end: 0,
                fs_header: vec![0u8; FS_HEADER_SIZE],
                body: Vec::new(),
            }),
        ],
        0x0100_0000_0001_0000,
        rights_id,
    )
}

/// CTR-encrypt a section body. `nca_abs_offset` is where the plaintext will
/// land inside the NCA; it must be 0x10-aligned.
pub(crate) fn ctr_encrypt_body(
    plain: &[u8],
    key: &[u8; 16],
    ctr_high: u32,
    ctr_low: u32,
    nca_abs_offset: u64,
) -> Vec<u8> {
    assert_eq!(nca_abs_offset % 0x10, 0);
    let mut data = plain.to_vec();
    let counter = section_counter(ctr_high, ctr_low, nca_abs_offset);
    ctr_apply(key, &counter, &mut data);
    data
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.write_u16::<LittleEndian>(v).unwrap();
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.write_u32::<LittleEndian>(v).unwrap();
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.write_u64::<LittleEndian>(v).unwrap();
}

/// An IVFC level for the FS-header builders.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IvfcLevelSpec {
    pub logical_offset: u64,
    pub size: u64,
    pub block_size: u32,
}

fn write_ivfc(buf: &mut Vec<u8>, levels: &[IvfcLevelSpec], master_hash: &[u8; 32]) {
    buf.extend_from_slice(b"IVFC");
    put_u32(buf, 0x20000);
    put_u32(buf, 0x20);
    put_u32(buf, levels.len() as u32);
    for i in 0..6 {
        if let Some(level) = levels.get(i) {
            put_u64(buf, level.logical_offset);
            put_u64(buf, level.size);
            put_u32(buf, level.block_size);
            put_u32(buf, 0);
        } else {
            buf.extend_from_slice(&[0u8; 0x18]);
        }
    }
    buf.extend_from_slice(&[0u8; 0x20]);
    buf.extend_from_slice(master_hash);
}

fn finish_fs_header(mut buf: Vec<u8>, ctr_low: u32, ctr_high: u32) -> Vec<u8> {
    assert_eq!(buf.len(), 0x140);
    put_u32(&mut buf, ctr_low);
    put_u32(&mut buf, ctr_high);
    buf.resize(FS_HEADER_SIZE, 0);
    buf
}

/// FS header for a CTR-encrypted PFS0 section.
#[allow(clippy::too_many_arguments)]
pub(crate) fn fs_header_pfs0(
    master_hash: &[u8; 32],
    block_size: u32,
    hash_table_offset: u64,
    hash_table_size: u64,
    pfs0_offset: u64,
    pfs0_size: u64,
    ctr_low: u32,
    ctr_high: u32,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FS_HEADER_SIZE);
    put_u16(&mut buf, 2);
    buf.push(1); // partition type
    buf.push(2); // fs type: PFS0
    buf.push(3); // crypt type: CTR
    buf.extend_from_slice(&[0u8; 3]);

    buf.extend_from_slice(master_hash);
    put_u32(&mut buf, block_size);
    put_u32(&mut buf, 2);
    put_u64(&mut buf, hash_table_offset);
    put_u64(&mut buf, hash_table_size);
    put_u64(&mut buf, pfs0_offset);
    put_u64(&mut buf, pfs0_size);
    buf.resize(0x140, 0);

    finish_fs_header(buf, ctr_low, ctr_high)
}

/// FS header for a RomFS section; `crypt_type` 1 (none), 2 (XTS) or 3 (CTR).
pub(crate) fn fs_header_romfs(
    levels: &[IvfcLevelSpec],
    master_hash: &[u8; 32],
    crypt_type: u8,
    ctr_low: u32,
    ctr_high: u32,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FS_HEADER_SIZE);
    put_u16(&mut buf, 2);
    buf.push(0); // partition type
    buf.push(3); // fs type: RomFS
    buf.push(crypt_type);
    buf.extend_from_slice(&[0u8; 3]);

    write_ivfc(&mut buf, levels, master_hash);
    buf.resize(0x140, 0);

    finish_fs_header(buf, ctr_low, ctr_high)
}

/// FS header for a BKTR patch section.
#[allow(clippy::too_many_arguments)]
pub(crate) fn fs_header_bktr(
    levels: &[IvfcLevelSpec],
    master_hash: &[u8; 32],
    relocation_offset: u64,
    relocation_size: u64,
    relocation_entries: u32,
    subsection_offset: u64,
    subsection_size: u64,
    subsection_entries: u32,
    ctr_low: u32,
    ctr_high: u32,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FS_HEADER_SIZE);
    put_u16(&mut buf, 2);
    buf.push(0); // partition type
    buf.push(3); // fs type: RomFS
    buf.push(4); // crypt type: BKTR
    buf.extend_from_slice(&[0u8; 3]);

    write_ivfc(&mut buf, levels, master_hash);
    buf.extend_from_slice(&[0u8; 0x18]);
    for (offset, size, entries) in [
        (relocation_offset, relocation_size, relocation_entries),
        (subsection_offset, subsection_size, subsection_entries),
    ] {
        put_u64(&mut buf, offset);
        put_u64(&mut buf, size);
        buf.extend_from_slice(b"BKTR");
        put_u32(&mut buf, 1);
        put_u32(&mut buf, entries);
        put_u32(&mut buf, 0);
    }
    assert_eq!(buf.len(), 0x140);

    finish_fs_header(buf, ctr_low, ctr_high)
}

/// Hash table over `data` in `block_size` units (final block zero-padded),
/// plus the master hash of the table itself.
pub(crate) fn sha256_hash_table(data: &[u8], block_size: u32) -> ([u8; 32], Vec<u8>) {
    let bs = block_size as usize;
    let mut table = Vec::new();
    for chunk in data.chunks(bs) {
        let mut block = chunk.to_vec();
        block.resize(bs, 0);
        table.extend_from_slice(&sha256(&block));
    }
    (sha256(&table), table)
}

/// Master hash of an IVFC level-0 table: the table zero-padded to a block
/// multiple before hashing.
pub(crate) fn ivfc_master_hash(table: &[u8], block_size: u32) -> [u8; 32] {
    let bs = u64::from(block_size);
    let blocks = (table.len() as u64).div_ceil(bs).max(1);
    let mut padded = table.to_vec();
    padded.resize((blocks * bs) as usize, 0);
    sha256(&padded)
}

/// Flat PFS0 image: header, entry table, string table, data region.
pub(crate) fn build_pfs0_image(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut string_table = Vec::new();
    let mut name_offsets = Vec::new();
    for (name, _) in entries {
        name_offsets.push(string_table.len() as u32);
        string_table.extend_from_slice(name.as_bytes());
        string_table.push(0);
    }
    // Keep the data region 0x10-aligned for readability of the fixtures.
    while string_table.len() % 0x10 != 0 {
        string_table.push(0);
    }

    let mut image = Vec::new();
    image.extend_from_slice(b"PFS0");
    put_u32(&mut image, entries.len() as u32);
    put_u32(&mut image, string_table.len() as u32);
    put_u32(&mut image, 0);

    let mut data_offset = 0u64;
    for ((_, data), name_offset) in entries.iter().zip(&name_offsets) {
        put_u64(&mut image, data_offset);
        put_u64(&mut image, data.len() as u64);
        put_u32(&mut image, *name_offset);
        put_u32(&mut image, 0);
        data_offset += data.len() as u64;
    }
    image.extend_from_slice(&string_table);
    for (_, data) in entries {
        image.extend_from_slice(data);
    }
    image
}

/// Minimal RomFS image builder: directories directly under the root, files
/// under the root (`""`) or under one of those directories.
pub(crate) fn build_romfs_image(dirs: &[&str], files: &[(&str, &str, &[u8])]) -> Vec<u8> {
    fn align4(len: usize) -> usize {
        (len + 3) & !3
    }

    // Directory table offsets: root first.
    let mut dir_offsets = vec![0u32];
    let mut cursor = 0x18u32;
    for name in dirs {
        dir_offsets.push(cursor);
        cursor += (0x18 + align4(name.len())) as u32;
    }
    let dir_table_len = cursor as usize;

    let dir_offset_of = |name: &str| -> u32 {
        if name.is_empty() {
            0
        } else {
            let index = dirs.iter().position(|d| *d == name).expect("unknown dir");
            dir_offsets[index + 1]
        }
    };

    // File table offsets and payload placement.
    let mut file_offsets = Vec::new();
    let mut cursor = 0u32;
    let mut data_cursor = 0u64;
    let mut file_data_offsets = Vec::new();
    for (_, name, data) in files {
        file_offsets.push(cursor);
        cursor += (0x20 + align4(name.len())) as u32;
        file_data_offsets.push(data_cursor);
        data_cursor += data.len() as u64;
    }
    let file_table_len = cursor as usize;

    // Sibling chains.
    let first_child_dir = if dirs.is_empty() {
        0xFFFF_FFFF
    } else {
        dir_offsets[1]
    };
    let first_file_of = |parent: &str| -> u32 {
        files
            .iter()
            .position(|(p, _, _)| *p == parent)
            .map_or(0xFFFF_FFFF, |i| file_offsets[i])
    };
    let next_file_of = |parent: &str, from: usize| -> u32 {
        files
            .iter()
            .enumerate()
            .skip(from + 1)
            .find(|(_, (p, _, _))| *p == parent)
            .map_or(0xFFFF_FFFF, |(i, _)| file_offsets[i])
    };

    // Hash tables: one bucket per entry, chained on collision.
    let dir_bucket_count = dirs.len() + 1;
    let mut dir_hash = vec![0xFFFF_FFFFu32; dir_bucket_count];
    let mut dir_hash_sibling = vec![0xFFFF_FFFFu32; dirs.len() + 1];
    // Root hashes with itself as parent.
    for (index, (offset, parent, name)) in std::iter::once((0u32, 0u32, ""))
        .chain(
            dirs.iter()
                .enumerate()
                .map(|(i, name)| (dir_offsets[i + 1], 0u32, *name)),
        )
        .enumerate()
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
    {
        let bucket =
            (crate::romfs::entry_hash(parent, name.as_bytes()) as usize) % dir_bucket_count;
        dir_hash_sibling[index] = dir_hash[bucket];
        dir_hash[bucket] = offset;
    }

    let file_bucket_count = files.len().max(1);
    let mut file_hash = vec![0xFFFF_FFFFu32; file_bucket_count];
    let mut file_hash_sibling = vec![0xFFFF_FFFFu32; files.len()];
    for (index, (parent, name, _)) in files.iter().enumerate().collect::<Vec<_>>().into_iter().rev()
    {
        let bucket = (crate::romfs::entry_hash(dir_offset_of(parent), name.as_bytes()) as usize)
            % file_bucket_count;
        file_hash_sibling[index] = file_hash[bucket];
        file_hash[bucket] = file_offsets[index];
    }

    // Serialize the directory table.
    let mut dir_table = Vec::with_capacity(dir_table_len);
    {
        // Root.
        put_u32(&mut dir_table, 0); // parent
        put_u32(&mut dir_table, 0xFFFF_FFFF); // sibling
        put_u32(&mut dir_table, first_child_dir);
        put_u32(&mut dir_table, first_file_of(""));
        put_u32(&mut dir_table, dir_hash_sibling[0]);
        put_u32(&mut dir_table, 0); // name length
    }
    for (i, name) in dirs.iter().enumerate() {
        put_u32(&mut dir_table, 0); // parent: root
        let sibling = dir_offsets.get(i + 2).copied().unwrap_or(0xFFFF_FFFF);
        put_u32(&mut dir_table, sibling);
        put_u32(&mut dir_table, 0xFFFF_FFFF); // no nested dirs
        put_u32(&mut dir_table, first_file_of(name));
        put_u32(&mut dir_table, dir_hash_sibling[i + 1]);
        put_u32(&mut dir_table, name.len() as u32);
        dir_table.extend_from_slice(name.as_bytes());
        dir_table.resize(align4(dir_table.len()), 0);
    }
    assert_eq!(dir_table.len(), dir_table_len);

    // Serialize the file table.
    let mut file_table = Vec::with_capacity(file_table_len);
    for (i, (parent, name, data)) in files.iter().enumerate() {
        put_u32(&mut file_table, dir_offset_of(parent));
        put_u32(&mut file_table, next_file_of(parent, i));
        put_u64(&mut file_table, file_data_offsets[i]);
        put_u64(&mut file_table, data.len() as u64);
        put_u32(&mut file_table, file_hash_sibling[i]);
        put_u32(&mut file_table, name.len() as u32);
        file_table.extend_from_slice(name.as_bytes());
        file_table.resize(align4(file_table.len()), 0);
    }
    assert_eq!(file_table.len(), file_table_len);

    // Assemble: header | dir hash | dir table | file hash | file table | data.
    let dir_hash_offset = 0x50u64;
    let dir_table_offset = dir_hash_offset + (dir_hash.len() * 4) as u64;
    let file_hash_offset = dir_table_offset + dir_table.len() as u64;
    let file_table_offset = file_hash_offset + (file_hash.len() * 4) as u64;
    let file_data_offset = file_table_offset + file_table.len() as u64;

    let mut image = Vec::new();
    put_u64(&mut image, 0x50);
    put_u64(&mut image, dir_hash_offset);
    put_u64(&mut image, (dir_hash.len() * 4) as u64);
    put_u64(&mut image, dir_table_offset);
    put_u64(&mut image, dir_table.len() as u64);
    put_u64(&mut image, file_hash_offset);
    put_u64(&mut image, (file_hash.len() * 4) as u64);
    put_u64(&mut image, file_table_offset);
    put_u64(&mut image, file_table.len() as u64);
    put_u64(&mut image, file_data_offset);
    for bucket in &dir_hash {
        put_u32(&mut image, *bucket);
    }
    image.extend_from_slice(&dir_table);
    for bucket in &file_hash {
        put_u32(&mut image, *bucket);
    }
    image.extend_from_slice(&file_table);
    for (_, _, data) in files {
        image.extend_from_slice(data);
    }
    image
}
