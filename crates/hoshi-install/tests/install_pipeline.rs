//! End-to-end installs over fabricated packages.
//!
//! Each test builds a real PFS0 package in memory (meta archive with
//! manifest, program archive, optionally compressed, plus ticket and
//! certificate chain) and drives it through the public entry points.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use sha2::{Digest, Sha256};

use hoshi_crypto::keys::KeyAreaIndex;
use hoshi_crypto::{KeySet, aes};
use hoshi_formats::cert::CertificateBuilder;
use hoshi_formats::cnmt::{CnmtBuilder, ContentClass, MetaType};
use hoshi_formats::nca::{ContentType, NcaBuilder, NcaHeader, NcaReader, RightsId};
use hoshi_formats::ncz::{NczBuilder, NczSection};
use hoshi_formats::pfs::PfsBuilder;
use hoshi_formats::ticket::TicketBuilder;
use hoshi_install::{
    Collections, Config, ConfigOverride, DirStorage, InstallError, InstallState, MemorySource,
    MemoryTitleDb, NullProgress, PfsContainer, ProgressSink, TitleDb, TitleRecord, TitleStatus,
    install_from_collections, install_from_source,
};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};

const TITLEKEK: [u8; 16] = [0x30; 16];
const TITLE_KEY: [u8; 16] = [0x77; 16];
const BODY_KEY: [u8; 16] = [0xA5; 16];

struct SigningKeys {
    fixed: RsaPrivateKey,
    meta: RsaPrivateKey,
    xs: RsaPrivateKey,
    root: RsaPrivateKey,
}

// RSA key generation is slow; share one set across the test binary.
fn signing_keys() -> &'static SigningKeys {
    static KEYS: OnceLock<SigningKeys> = OnceLock::new();
    KEYS.get_or_init(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let mut rng = rand::thread_rng();
        SigningKeys {
            fixed: RsaPrivateKey::new(&mut rng, 2048).unwrap(),
            meta: RsaPrivateKey::new(&mut rng, 2048).unwrap(),
            xs: RsaPrivateKey::new(&mut rng, 2048).unwrap(),
            root: RsaPrivateKey::new(&mut rng, 2048).unwrap(),
        }
    })
}

fn key_set() -> KeySet {
    let signing = signing_keys();
    let mut keys = KeySet::new();
    keys.set_header_key([0x10; 32]);
    keys.set_key_area_key(KeyAreaIndex::Application, 0, [0x20; 16]);
    keys.set_titlekek(0, TITLEKEK);
    keys.set_header_signature_key(0, RsaPublicKey::from(&signing.fixed));
    keys.set_meta_signature_key(RsaPublicKey::from(&signing.meta));
    keys
}

struct TitleSpec {
    title_id: u64,
    version: u32,
    meta_type: MetaType,
    rights_id: Option<RightsId>,
    compress: bool,
    payload_len: usize,
}

impl TitleSpec {
    fn base(title_id: u64) -> Self {
        Self {
            title_id,
            version: 0x10000,
            meta_type: MetaType::Application,
            rights_id: None,
            compress: false,
            payload_len: 0x1000,
        }
    }

    fn content_id(&self) -> [u8; 16] {
        let mut id = [0u8; 16];
        id[..8].copy_from_slice(&self.title_id.to_le_bytes());
        id[15] = 1;
        id
    }

    fn meta_id(&self) -> [u8; 16] {
        let mut id = self.content_id();
        id[15] = 2;
        id
    }
}

fn signed_ticket(asserted: RightsId, revision: u8) -> Vec<u8> {
    let signing = signing_keys();
    let mut wrapped = TITLE_KEY;
    aes::ecb_encrypt(&TITLEKEK, &mut wrapped).unwrap();

    let unsigned = TicketBuilder::new()
        .rights_id(asserted)
        .wrapped_title_key(wrapped)
        .master_key_revision(revision)
        .issuer("Root-XS00000020")
        .build()
        .unwrap();
    let digest = Sha256::digest(unsigned.signed_body());
    let sig = signing
        .xs
        .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .unwrap();
    TicketBuilder::new()
        .rights_id(asserted)
        .wrapped_title_key(wrapped)
        .master_key_revision(revision)
        .issuer("Root-XS00000020")
        .signature(sig.try_into().unwrap())
        .build()
        .unwrap()
        .as_bytes()
        .to_vec()
}

fn cert_chain_bytes() -> Vec<u8> {
    let signing = signing_keys();
    CertificateBuilder::new("Root", "XS00000020")
        .public_key(signing.xs.to_public_key())
        .sign(&signing.root)
        .unwrap()
}

/// Build the files of one title; returns (files, program image).
fn build_title(keys: &KeySet, spec: &TitleSpec) -> (Vec<(String, Vec<u8>)>, Vec<u8>) {
    let signing = signing_keys();
    let mut rng = rand::thread_rng();
    let payload: Vec<u8> = (0..spec.payload_len).map(|i| (i % 253) as u8).collect();

    let mut builder = NcaBuilder::new()
        .content_type(ContentType::Program)
        .program_id(spec.title_id)
        .body_key(BODY_KEY)
        .add_section(payload);
    if let Some(rights_id) = spec.rights_id {
        builder = builder.rights_id(rights_id, TITLE_KEY);
    }
    let program = builder
        .build_signed(keys, &mut rng, &signing.fixed, &signing.meta)
        .unwrap();
    let program_hash: [u8; 32] = Sha256::digest(&program).into();

    let cnmt = CnmtBuilder::new(spec.title_id, spec.meta_type)
        .version(spec.version)
        .application_id(spec.title_id & !0xFFF)
        .add_content(
            spec.content_id(),
            program_hash,
            program.len() as u64,
            ContentClass::Program,
        )
        .build()
        .unwrap();
    let inner = PfsBuilder::new()
        .add_file(format!("{:016x}.cnmt", spec.title_id), cnmt)
        .build()
        .unwrap();
    let meta = NcaBuilder::new()
        .content_type(ContentType::Meta)
        .program_id(spec.title_id)
        .body_key(BODY_KEY)
        .add_section(inner)
        .build_signed(keys, &mut rng, &signing.fixed, &signing.meta)
        .unwrap();

    let mut files = vec![(format!("{}.cnmt.nca", hex::encode(spec.meta_id())), meta)];

    let program_entry = if spec.compress {
        let header = NcaHeader::parse_encrypted(&program, keys).unwrap();
        let section = header.section(0).unwrap();
        let body_key = spec.rights_id.map_or(BODY_KEY, |_| TITLE_KEY);
        let sections = vec![NczSection::new_ctr(
            0x4000,
            program.len() as u64 - 0x4000,
            body_key,
            section.nonce,
        )];
        let compressed = NczBuilder::new(sections)
            .with_blocks(14)
            .build(&program)
            .unwrap();
        (format!("{}.ncz", hex::encode(spec.content_id())), compressed)
    } else {
        (
            format!("{}.nca", hex::encode(spec.content_id())),
            program.clone(),
        )
    };
    files.push(program_entry);

    if let Some(rights_id) = spec.rights_id {
        files.push((format!("{rights_id}.tik"), signed_ticket(rights_id, 0)));
        files.push((format!("{rights_id}.cert"), cert_chain_bytes()));
    }
    (files, program)
}

fn package(files: Vec<(String, Vec<u8>)>) -> Vec<u8> {
    let mut builder = PfsBuilder::new();
    for (name, data) in files {
        builder = builder.add_file(name, data);
    }
    builder.build().unwrap()
}

fn rights(last: u8) -> RightsId {
    let mut id = [0u8; 16];
    id[15] = last;
    RightsId(id)
}

#[test]
fn standard_crypto_title_installs_verified() {
    let keys = key_set();
    let spec = TitleSpec::base(0x0100_0000_0000_1000);
    let (files, program) = build_title(&keys, &spec);

    let dir = tempfile::tempdir().unwrap();
    let mut storage = DirStorage::new(dir.path());
    let mut db = MemoryTitleDb::new();
    let report = install_from_source(
        MemorySource::new(package(files)),
        &keys,
        &Config::default(),
        &ConfigOverride::default(),
        &mut db,
        &mut storage,
        &NullProgress,
    )
    .unwrap();

    assert_eq!(report.installed(), 1);
    assert!(matches!(
        report.outcomes[0].status,
        TitleStatus::Installed { verified: true }
    ));

    let written = std::fs::read(
        dir.path()
            .join(format!("{}.nca", hex::encode(spec.content_id()))),
    )
    .unwrap();
    assert_eq!(written, program);

    let required = [spec.content_id(), spec.meta_id()];
    assert_eq!(
        db.state(spec.title_id, &required).unwrap(),
        InstallState::Installed
    );
}

#[test]
fn compressed_title_reconstructs_original_bytes() {
    let keys = key_set();
    let mut spec = TitleSpec::base(0x0100_0000_0000_2000);
    spec.compress = true;
    spec.payload_len = 0x4000;
    let (files, program) = build_title(&keys, &spec);

    let dir = tempfile::tempdir().unwrap();
    let mut storage = DirStorage::new(dir.path());
    let mut db = MemoryTitleDb::new();
    let report = install_from_source(
        MemorySource::new(package(files)),
        &keys,
        &Config::default(),
        &ConfigOverride::default(),
        &mut db,
        &mut storage,
        &NullProgress,
    )
    .unwrap();
    assert_eq!(report.installed(), 1);

    // The installed archive is stored decompressed and re-encrypted,
    // byte-identical to the pre-compression image.
    let written = std::fs::read(
        dir.path()
            .join(format!("{}.nca", hex::encode(spec.content_id()))),
    )
    .unwrap();
    assert_eq!(written, program);
}

#[test]
fn conversion_strips_ticket_and_rights_id_for_base_titles() {
    let keys = key_set();
    let mut spec = TitleSpec::base(0x0100_0000_0000_3000);
    spec.rights_id = Some(rights(1));
    let (files, _) = build_title(&keys, &spec);

    let dir = tempfile::tempdir().unwrap();
    let mut storage = DirStorage::new(dir.path());
    let mut db = MemoryTitleDb::new();
    let config = Config {
        convert_to_standard_crypto: true,
        ..Config::default()
    };
    let report = install_from_source(
        MemorySource::new(package(files)),
        &keys,
        &config,
        &ConfigOverride::default(),
        &mut db,
        &mut storage,
        &NullProgress,
    )
    .unwrap();
    assert_eq!(report.installed(), 1);

    // No ticket file lands next to the content.
    assert!(!dir.path().join(format!("{}.tik", rights(1))).exists());

    // The written archive opens without any ticket.
    let written = std::fs::read(
        dir.path()
            .join(format!("{}.nca", hex::encode(spec.content_id()))),
    )
    .unwrap();
    let mut reader = NcaReader::new(Arc::new(written), &keys, None).unwrap();
    assert!(reader.header().rights_id().is_zero());
    let mut buf = vec![0u8; 64];
    reader.read_decrypted(0, 0, &mut buf).unwrap();
    let expected: Vec<u8> = (0..64).map(|i| (i % 253) as u8).collect();
    assert_eq!(buf, expected);
}

#[test]
fn addon_keeps_ticket_even_when_converting() {
    let keys = key_set();
    let mut spec = TitleSpec::base(0x0100_0000_0000_4000);
    spec.meta_type = MetaType::AddOnContent;
    spec.rights_id = Some(rights(3));
    let (files, program) = build_title(&keys, &spec);

    let dir = tempfile::tempdir().unwrap();
    let mut storage = DirStorage::new(dir.path());
    let mut db = MemoryTitleDb::new();
    let config = Config {
        convert_to_standard_crypto: true,
        ..Config::default()
    };
    let report = install_from_source(
        MemorySource::new(package(files)),
        &keys,
        &config,
        &ConfigOverride::default(),
        &mut db,
        &mut storage,
        &NullProgress,
    )
    .unwrap();
    assert_eq!(report.installed(), 1);

    // Ticket installed, archive untouched.
    assert!(dir.path().join(format!("{}.tik", rights(3))).exists());
    assert!(dir.path().join(format!("{}.cert", rights(3))).exists());
    let written = std::fs::read(
        dir.path()
            .join(format!("{}.nca", hex::encode(spec.content_id()))),
    )
    .unwrap();
    assert_eq!(written, program);
}

#[test]
fn ticket_asserting_wrong_rights_id_fails_title() {
    let keys = key_set();
    let mut spec = TitleSpec::base(0x0100_0000_0000_5000);
    spec.rights_id = Some(rights(2));
    let (mut files, _) = build_title(&keys, &spec);

    // Replace the ticket with one asserting ...01 while filed as ...02.
    let ticket_name = format!("{}.tik", rights(2));
    for (name, data) in &mut files {
        if *name == ticket_name {
            *data = signed_ticket(rights(1), 0);
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let mut storage = DirStorage::new(dir.path());
    let mut db = MemoryTitleDb::new();
    let report = install_from_source(
        MemorySource::new(package(files)),
        &keys,
        &Config::default(),
        &ConfigOverride::default(),
        &mut db,
        &mut storage,
        &NullProgress,
    )
    .unwrap();

    assert_eq!(report.failed(), 1);
    assert!(matches!(
        report.outcomes[0].status,
        TitleStatus::Failed(InstallError::InvalidTicketRightsId)
    ));
    // Nothing written.
    assert!(
        !dir.path()
            .join(format!("{}.nca", hex::encode(spec.content_id())))
            .exists()
    );
}

#[test]
fn bad_block_version_writes_nothing() {
    let keys = key_set();
    let mut spec = TitleSpec::base(0x0100_0000_0000_6000);
    spec.compress = true;
    spec.payload_len = 0x4000;
    let (mut files, _) = build_title(&keys, &spec);

    let ncz_name = format!("{}.ncz", hex::encode(spec.content_id()));
    for (name, data) in &mut files {
        if *name == ncz_name {
            // Block header follows the 8+8 byte section header and one
            // 0x50-byte section record; its version byte is at +8.
            let version_at = 0x4000 + 8 + 8 + 0x50 + 8;
            assert_eq!(data[version_at], 2);
            data[version_at] = 3;
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let mut storage = DirStorage::new(dir.path());
    let mut db = MemoryTitleDb::new();
    let report = install_from_source(
        MemorySource::new(package(files)),
        &keys,
        &Config::default(),
        &ConfigOverride::default(),
        &mut db,
        &mut storage,
        &NullProgress,
    )
    .unwrap();

    assert!(matches!(
        report.outcomes[0].status,
        TitleStatus::Failed(InstallError::InvalidNczBlockVersion(3))
    ));
    // Zero content bytes written anywhere.
    let entries: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .collect();
    assert!(entries.is_empty());
    assert_eq!(db.records().count(), 0);
}

struct CancelAfter {
    reports: AtomicU32,
    after: u32,
}

impl ProgressSink for CancelAfter {
    fn report(&self, _done: u64, _total: u64) {
        self.reports.fetch_add(1, Ordering::Relaxed);
    }

    fn is_cancelled(&self) -> bool {
        self.reports.load(Ordering::Relaxed) >= self.after
    }
}

#[test]
fn cancellation_mid_write_commits_nothing() {
    let keys = key_set();
    let mut spec = TitleSpec::base(0x0100_0000_0000_7000);
    // Two chunks for the program archive.
    spec.payload_len = 0x50000;
    let (files, _) = build_title(&keys, &spec);

    let dir = tempfile::tempdir().unwrap();
    let mut storage = DirStorage::new(dir.path());
    let mut db = MemoryTitleDb::new();
    let progress = CancelAfter {
        reports: AtomicU32::new(0),
        after: 2,
    };
    let report = install_from_source(
        MemorySource::new(package(files)),
        &keys,
        &Config::default(),
        &ConfigOverride::default(),
        &mut db,
        &mut storage,
        &progress,
    )
    .unwrap();

    assert!(report.cancelled());
    assert_eq!(db.records().count(), 0);
    // No file of the title reaches final storage, not even archives
    // whose bytes were fully streamed before the cancel, and staging
    // is clean.
    let finals: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .map(|e| e.file_name())
        .collect();
    assert!(finals.is_empty(), "leftover files: {finals:?}");
    let staging = dir.path().join(".staging");
    if staging.exists() {
        assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 0);
    }
}

#[test]
fn downgrades_are_gated_by_policy() {
    let keys = key_set();
    let mut spec = TitleSpec::base(0x0100_0000_0000_8000);
    spec.version = 0x10000;
    let (files, _) = build_title(&keys, &spec);
    let image = package(files);

    let mut db = MemoryTitleDb::new();
    db.commit(TitleRecord {
        title_id: spec.title_id,
        version: 0x20000,
        meta_type: MetaType::Application,
        content_ids: vec![[9; 16]],
        verified: true,
    })
    .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let mut storage = DirStorage::new(dir.path());
    let report = install_from_source(
        MemorySource::new(image.clone()),
        &keys,
        &Config::default(),
        &ConfigOverride::default(),
        &mut db,
        &mut storage,
        &NullProgress,
    )
    .unwrap();
    assert!(matches!(report.outcomes[0].status, TitleStatus::Skipped));

    // allow_downgrade lets the older version through.
    let report = install_from_source(
        MemorySource::new(image),
        &keys,
        &Config {
            allow_downgrade: true,
            ..Config::default()
        },
        &ConfigOverride::default(),
        &mut db,
        &mut storage,
        &NullProgress,
    )
    .unwrap();
    assert_eq!(report.installed(), 1);
    assert_eq!(db.installed_version(spec.title_id), Some(0x10000));
}

#[test]
fn partial_installs_are_reinstalled_despite_skip_flag() {
    let keys = key_set();
    let spec = TitleSpec::base(0x0100_0000_0000_9000);
    let (files, _) = build_title(&keys, &spec);

    // Record holds only one of the two required archives.
    let mut db = MemoryTitleDb::new();
    db.commit(TitleRecord {
        title_id: spec.title_id,
        version: spec.version,
        meta_type: MetaType::Application,
        content_ids: vec![spec.content_id()],
        verified: true,
    })
    .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let mut storage = DirStorage::new(dir.path());
    let report = install_from_source(
        MemorySource::new(package(files)),
        &keys,
        &Config {
            skip_if_already_installed: true,
            ..Config::default()
        },
        &ConfigOverride::default(),
        &mut db,
        &mut storage,
        &NullProgress,
    )
    .unwrap();

    // Partial counts as not installed.
    assert_eq!(report.installed(), 1);
    let required = [spec.content_id(), spec.meta_id()];
    assert_eq!(
        db.state(spec.title_id, &required).unwrap(),
        InstallState::Installed
    );
}

#[test]
fn ticket_only_installs_just_the_ticket() {
    let keys = key_set();
    let mut spec = TitleSpec::base(0x0100_0000_0000_A000);
    spec.rights_id = Some(rights(4));
    let (files, _) = build_title(&keys, &spec);

    let dir = tempfile::tempdir().unwrap();
    let mut storage = DirStorage::new(dir.path());
    let mut db = MemoryTitleDb::new();
    let report = install_from_source(
        MemorySource::new(package(files)),
        &keys,
        &Config::default(),
        &ConfigOverride {
            ticket_only: Some(true),
            ..ConfigOverride::default()
        },
        &mut db,
        &mut storage,
        &NullProgress,
    )
    .unwrap();
    assert_eq!(report.installed(), 1);

    assert!(dir.path().join(format!("{}.tik", rights(4))).exists());
    assert!(
        !dir.path()
            .join(format!("{}.nca", hex::encode(spec.content_id())))
            .exists()
    );
    assert_eq!(db.records().count(), 0);
}

#[test]
fn ticket_cut_for_wrong_key_generation_fails_at_planning() {
    let keys = key_set();
    let mut spec = TitleSpec::base(0x0100_0000_0000_B000);
    spec.rights_id = Some(rights(5));
    let (mut files, _) = build_title(&keys, &spec);

    // Swap in a ticket cut for master-key revision 9; the archives
    // were built for generation 0.
    let ticket_name = format!("{}.tik", rights(5));
    for (name, data) in &mut files {
        if *name == ticket_name {
            *data = signed_ticket(rights(5), 9);
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let mut storage = DirStorage::new(dir.path());
    let mut db = MemoryTitleDb::new();
    let report = install_from_source(
        MemorySource::new(package(files)),
        &keys,
        &Config::default(),
        &ConfigOverride::default(),
        &mut db,
        &mut storage,
        &NullProgress,
    )
    .unwrap();

    // The mismatch reads as a ticket problem, not a missing titlekek.
    assert_eq!(report.failed(), 1);
    assert!(matches!(
        report.outcomes[0].status,
        TitleStatus::Failed(InstallError::InvalidTicketKeyRevision { ticket: 9, archive: 0 })
    ));
}

#[test]
fn batch_continues_past_a_failing_container() {
    let keys = key_set();
    let good = TitleSpec::base(0x0100_0000_0000_C000);
    let (good_files, good_program) = build_title(&keys, &good);

    let mut bad = TitleSpec::base(0x0100_0000_0000_D000);
    bad.compress = true;
    bad.payload_len = 0x4000;
    let (mut bad_files, _) = build_title(&keys, &bad);
    let ncz_name = format!("{}.ncz", hex::encode(bad.content_id()));
    for (name, data) in &mut bad_files {
        if *name == ncz_name {
            let version_at = 0x4000 + 8 + 8 + 0x50 + 8;
            assert_eq!(data[version_at], 2);
            data[version_at] = 3;
        }
    }

    let mut collections = Collections::new();
    collections.push(Box::new(
        PfsContainer::parse(MemorySource::new(package(bad_files))).unwrap(),
    ));
    collections.push(Box::new(
        PfsContainer::parse(MemorySource::new(package(good_files))).unwrap(),
    ));

    let dir = tempfile::tempdir().unwrap();
    let mut storage = DirStorage::new(dir.path());
    let mut db = MemoryTitleDb::new();
    let report = install_from_collections(
        &collections,
        &keys,
        &Config::default(),
        &ConfigOverride::default(),
        &mut db,
        &mut storage,
        &NullProgress,
    )
    .unwrap();

    // The broken title is recorded and the batch carries on.
    assert_eq!(report.failed(), 1);
    assert_eq!(report.installed(), 1);
    assert!(!report.cancelled());

    let written = std::fs::read(
        dir.path()
            .join(format!("{}.nca", hex::encode(good.content_id()))),
    )
    .unwrap();
    assert_eq!(written, good_program);
    assert_eq!(db.records().count(), 1);
    assert_eq!(db.installed_version(good.title_id), Some(good.version));
    assert!(db.installed_version(bad.title_id).is_none());
}

#[test]
fn non_container_input_reports_container_not_found() {
    let keys = key_set();
    let dir = tempfile::tempdir().unwrap();
    let mut storage = DirStorage::new(dir.path());
    let mut db = MemoryTitleDb::new();
    let err = install_from_source(
        MemorySource::new(vec![0u8; 128]),
        &keys,
        &Config::default(),
        &ConfigOverride::default(),
        &mut db,
        &mut storage,
        &NullProgress,
    )
    .unwrap_err();
    assert!(matches!(err, InstallError::ContainerNotFound));
}
