use crate::error::NcaError;
use crate::testutil::{
    build_nca, ctr_encrypt_body, fs_header_pfs0, open_fixture, pfs0_fixture, sha256_hash_table,
    try_open_fixture, SectionSpec, KEY_AREA,
};

const ENTRIES: [(&str, &[u8]); 5] = [
    ("main", b"\x7FNSO-main-payload"),
    ("main.npdm", b"META\x00\x00program-meta"),
    ("rtld", b"\x7FNSO-rtld"),
    ("sdk", b"\x7FNSO-sdk-blob"),
    ("subsdk0", b"\x7FNSO-subsdk"),
];

#[test]
fn enumerates_entries_in_order() {
    let mut archive = open_fixture(pfs0_fixture(&ENTRIES));
    let view = archive.pfs0(0).unwrap();

    assert_eq!(view.entry_count(), 5);
    let names: Vec<&str> = view.entries().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["main", "main.npdm", "rtld", "sdk", "subsdk0"]);
    assert!(view.is_exefs());

    let (index, entry) = view.entry_by_name("rtld").unwrap();
    assert_eq!(index, 2);
    assert_eq!(entry.size, ENTRIES[2].1.len() as u64);
}

#[test]
fn reads_entry_payloads() {
    let mut archive = open_fixture(pfs0_fixture(&ENTRIES));
    let mut view = archive.pfs0(0).unwrap();

    for (index, (_, data)) in ENTRIES.iter().enumerate() {
        assert_eq!(view.read_entry_all(index).unwrap(), *data);
    }

    // Partial read out of the middle of an entry.
    let slice = view.read_entry(0, 4, 8).unwrap();
    assert_eq!(slice, ENTRIES[0].1[4..12]);

    assert!(matches!(
        view.read_entry(0, ENTRIES[0].1.len() as u64, 1),
        Err(NcaError::OutOfRange { .. })
    ));
    assert!(matches!(view.read_entry(9, 0, 1), Err(NcaError::NotFound)));
}

#[test]
fn partition_without_npdm_is_not_exefs() {
    let entries: [(&str, &[u8]); 2] = [("logo.png", b"\x89PNG"), ("data.bin", b"blob")];
    let mut archive = open_fixture(pfs0_fixture(&entries));
    let view = archive.pfs0(0).unwrap();
    assert!(!view.is_exefs());
}

#[test]
fn bad_magic_poisons_the_handle() {
    // A consistent hash tree over an image that is not a PFS0.
    let image = b"JUNKJUNKJUNKJUNKJUNKJUNKJUNKJUNK".to_vec();
    let (master, table) = sha256_hash_table(&image, 0x400);

    let mut plain = table.clone();
    plain.resize(0x400, 0);
    plain.extend_from_slice(&image);
    plain.resize(0x600, 0);
    let body = ctr_encrypt_body(&plain, &KEY_AREA[2], 7, 9, 6 * 0x200);

    let nca = build_nca(
        &[Some(SectionSpec {
            media_start: 6,
            media_end: 9,
            fs_header: fs_header_pfs0(
                &master,
                0x400,
                0,
                table.len() as u64,
                0x400,
                image.len() as u64,
                9,
                7,
            ),
            body,
        })],
        0x0100_0000_0001_0000,
        [0u8; 16],
    );

    let mut archive = open_fixture(nca);
    assert!(matches!(
        archive.pfs0(0),
        Err(NcaError::MalformedHeader { .. })
    ));

    // Poisoned: even plain section reads now fail fast.
    assert!(matches!(
        archive.read_section(0, 0, 0x10),
        Err(NcaError::MalformedHeader { .. })
    ));
}

#[test]
fn tampered_payload_is_detected() {
    let mut nca = pfs0_fixture(&ENTRIES);

    // Flip one ciphertext bit inside the hashed image of section 0; 0x80
    // lands in the entry table, which the open path reads.
    let section_base = 6 * 0x200usize;
    let image_base = section_base + 0x400;
    nca[image_base + 0x80] ^= 0x01;

    let mut archive = try_open_fixture(nca).unwrap();
    let err = match archive.pfs0(0) {
        Err(e) => e,
        Ok(_) => panic!("corrupt partition must not parse cleanly"),
    };
    assert!(matches!(err, NcaError::IntegrityFailure { section: 0, .. }));
}

#[test]
fn romfs_section_rejects_pfs0_view() {
    let mut archive = open_fixture(pfs0_fixture(&ENTRIES));
    assert!(matches!(
        archive.romfs(0),
        Err(NcaError::UnsupportedArchive { .. })
    ));
}
