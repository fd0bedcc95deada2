// used for persistence
use rusqlite::{Connection, OpenFlags, Statement, params};
use std::process;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

// used for reproducible demo data
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::info;

use crate::catalog::{BEST_CLASSES, REDSHIFT_TYPES};
use crate::error::{PortalError, Result};

static NEXT_MEMORY_STORE: AtomicU64 = AtomicU64::new(0);

/// Where the store keeps its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceMode {
    /// A private in-memory database, gone when the store is dropped.
    InMemory,
    /// A SQLite file, created when missing.
    File(String),
}

/// Hands out connections to one AGN database. Every request gets its own
/// connection, so nothing here is shared between threads except the keeper
/// that holds an in-memory database open.
pub struct Store {
    uri: String,
    flags: OpenFlags,
    keeper: Option<Mutex<Connection>>,
}

impl Store {
    pub fn open(mode: PersistenceMode) -> Result<Store> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let store = match mode {
            PersistenceMode::InMemory => {
                // a named shared-cache database lives as long as one connection to it does
                let uri = format!(
                    "file:agndb-mem-{}-{}?mode=memory&cache=shared",
                    process::id(),
                    NEXT_MEMORY_STORE.fetch_add(1, Ordering::Relaxed)
                );
                let keeper = Connection::open_with_flags(&uri, flags)?;
                Store { uri, flags, keeper: Some(Mutex::new(keeper)) }
            }
            PersistenceMode::File(path) => Store { uri: path, flags, keeper: None },
        };
        let connection = store.connect()?;
        create_schema(&connection)?;
        info!(store = %store.describe(), "store opened");
        Ok(store)
    }

    /// A read-write connection.
    pub fn connect(&self) -> Result<Connection> {
        let connection = Connection::open_with_flags(&self.uri, self.flags)?;
        connection.pragma_update(None, "foreign_keys", true)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        Ok(connection)
    }

    /// A connection that refuses writes, used for searches and exports.
    pub fn reader(&self) -> Result<Connection> {
        let connection = self.connect()?;
        connection.pragma_update(None, "query_only", true)?;
        Ok(connection)
    }

    pub fn is_in_memory(&self) -> bool {
        self.keeper.is_some()
    }

    pub fn describe(&self) -> &str {
        if self.is_in_memory() { "in-memory" } else { &self.uri }
    }

    /// Fills an empty store with `count` synthetic sources. A store that
    /// already holds sources is left alone.
    pub fn seed_demo(&self, count: usize, seed: u64) -> Result<usize> {
        let connection = self.connect()?;
        if Persistor::new(&connection)?.source_count()? > 0 {
            info!("store already holds sources, demo seeding skipped");
            return Ok(0);
        }
        let seeded = seed_demo(&connection, count, seed)?;
        info!(sources = seeded, seed, "demo sources seeded");
        Ok(seeded)
    }
}

pub fn create_schema(connection: &Connection) -> Result<()> {
    connection.execute_batch(
        "
        create table if not exists source_agn (
            agn_id integer not null,
            ra real not null,
            declination real not null,
            constraint referenceable_agn_id primary key (
                agn_id
            )
        );
        create table if not exists photometry (
            phot_id integer not null,
            agn_id integer not null,
            band_label text null,
            filter_name text null,
            mag_value real null,
            mag_error real null,
            extinction real null,
            constraint photometry_of_source foreign key (
                agn_id
            ) references source_agn(agn_id) on delete cascade,
            constraint referenceable_phot_id primary key (
                phot_id
            )
        );
        create index if not exists photometry_by_source on photometry (agn_id, phot_id);
        create table if not exists redshift_measurement (
            redshift_id integer not null,
            agn_id integer not null,
            redshift_type text null,
            z_value real null,
            z_error real null,
            constraint redshift_of_source foreign key (
                agn_id
            ) references source_agn(agn_id) on delete cascade,
            constraint referenceable_redshift_id primary key (
                redshift_id
            )
        );
        create index if not exists redshift_by_source on redshift_measurement (agn_id, redshift_id);
        create table if not exists classification (
            class_id integer not null,
            agn_id integer not null,
            spec_class text null,
            gen_class text null,
            xray_class text null,
            best_class text null,
            image_class text null,
            sed_class text null,
            constraint classification_of_source foreign key (
                agn_id
            ) references source_agn(agn_id) on delete cascade,
            constraint referenceable_class_id primary key (
                class_id
            )
        );
        create index if not exists classification_by_source on classification (agn_id, class_id);
        ",
    )?;
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhotometryRecord {
    pub band_label: Option<String>,
    pub filter_name: Option<String>,
    pub mag_value: Option<f64>,
    pub mag_error: Option<f64>,
    pub extinction: Option<f64>,
}
impl PhotometryRecord {
    pub fn new(band_label: &str, filter_name: &str, mag_value: f64) -> Self {
        Self {
            band_label: Some(band_label.to_string()),
            filter_name: Some(filter_name.to_string()),
            mag_value: Some(mag_value),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RedshiftRecord {
    pub redshift_type: Option<String>,
    pub z_value: Option<f64>,
    pub z_error: Option<f64>,
}
impl RedshiftRecord {
    pub fn new(redshift_type: &str, z_value: f64) -> Self {
        Self {
            redshift_type: Some(redshift_type.to_string()),
            z_value: Some(z_value),
            z_error: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassificationRecord {
    pub spec_class: Option<String>,
    pub gen_class: Option<String>,
    pub xray_class: Option<String>,
    pub best_class: Option<String>,
    pub image_class: Option<String>,
    pub sed_class: Option<String>,
}
impl ClassificationRecord {
    pub fn best(best_class: &str) -> Self {
        Self {
            best_class: Some(best_class.to_string()),
            gen_class: Some(best_class.to_string()),
            ..Default::default()
        }
    }
}

/// Prepared insert statements over one connection.
pub struct Persistor<'db> {
    db: &'db Connection,
    add_source: Statement<'db>,
    add_photometry: Statement<'db>,
    add_redshift: Statement<'db>,
    add_classification: Statement<'db>,
    count_sources: Statement<'db>,
}
impl<'db> Persistor<'db> {
    pub fn new(connection: &'db Connection) -> Result<Persistor<'db>> {
        Ok(Persistor {
            db: connection,
            add_source: connection.prepare(
                "
                insert into source_agn (
                    ra,
                    declination
                ) values (?, ?)
            ",
            )?,
            add_photometry: connection.prepare(
                "
                insert into photometry (
                    agn_id,
                    band_label,
                    filter_name,
                    mag_value,
                    mag_error,
                    extinction
                ) values (?, ?, ?, ?, ?, ?)
            ",
            )?,
            add_redshift: connection.prepare(
                "
                insert into redshift_measurement (
                    agn_id,
                    redshift_type,
                    z_value,
                    z_error
                ) values (?, ?, ?, ?)
            ",
            )?,
            add_classification: connection.prepare(
                "
                insert into classification (
                    agn_id,
                    spec_class,
                    gen_class,
                    xray_class,
                    best_class,
                    image_class,
                    sed_class
                ) values (?, ?, ?, ?, ?, ?, ?)
            ",
            )?,
            count_sources: connection.prepare(
                "
                select count(*)
                    from source_agn
            ",
            )?,
        })
    }

    /// Inserts a source and returns its `agn_id`.
    pub fn add_source(&mut self, ra: f64, declination: f64) -> Result<i64> {
        self.add_source.execute(params![ra, declination])?;
        Ok(self.db.last_insert_rowid())
    }

    pub fn add_photometry(&mut self, agn_id: i64, record: &PhotometryRecord) -> Result<i64> {
        self.add_photometry.execute(params![
            agn_id,
            record.band_label,
            record.filter_name,
            record.mag_value,
            record.mag_error,
            record.extinction
        ])?;
        Ok(self.db.last_insert_rowid())
    }

    pub fn add_redshift(&mut self, agn_id: i64, record: &RedshiftRecord) -> Result<i64> {
        self.add_redshift
            .execute(params![agn_id, record.redshift_type, record.z_value, record.z_error])?;
        Ok(self.db.last_insert_rowid())
    }

    pub fn add_classification(&mut self, agn_id: i64, record: &ClassificationRecord) -> Result<i64> {
        self.add_classification.execute(params![
            agn_id,
            record.spec_class,
            record.gen_class,
            record.xray_class,
            record.best_class,
            record.image_class,
            record.sed_class
        ])?;
        Ok(self.db.last_insert_rowid())
    }

    pub fn source_count(&mut self) -> Result<u64> {
        let count: i64 = self.count_sources.query_row([], |row| row.get(0))?;
        u64::try_from(count).map_err(|_| PortalError::Invariant(format!("negative row count {count}")))
    }
}

// ------------- Demo data --------------
const BANDS: [(&str, &[&str]); 8] = [
    ("U", &["SDSS u", "Johnson U"]),
    ("B", &["SDSS g", "Johnson B"]),
    ("V", &["SDSS r", "Johnson V"]),
    ("R", &["SDSS i", "Johnson R"]),
    ("I", &["SDSS z", "Johnson I"]),
    ("J", &["2MASS J"]),
    ("H", &["2MASS H"]),
    ("K", &["2MASS K", "2MASS Ks"]),
];

/// Inserts `count` synthetic sources in one transaction. The same seed always
/// produces the same rows.
pub fn seed_demo(connection: &Connection, count: usize, seed: u64) -> Result<usize> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let transaction = connection.unchecked_transaction()?;
    {
        let mut persistor = Persistor::new(&transaction)?;
        for _ in 0..count {
            let agn_id = persistor.add_source(rng.gen_range(0.0..360.0), rng.gen_range(-90.0..90.0))?;
            for record in demo_photometry(&mut rng) {
                persistor.add_photometry(agn_id, &record)?;
            }
            if rng.gen_bool(0.7) {
                persistor.add_redshift(agn_id, &demo_redshift(&mut rng))?;
            }
            if rng.gen_bool(0.8) {
                persistor.add_classification(agn_id, &demo_classification(&mut rng))?;
            }
        }
    }
    transaction.commit()?;
    Ok(count)
}

fn demo_photometry(rng: &mut ChaCha8Rng) -> Vec<PhotometryRecord> {
    let wanted = rng.gen_range(3..=10).min(BANDS.len());
    let picked: Vec<_> = BANDS.choose_multiple(rng, wanted).copied().collect();
    picked
        .into_iter()
        .map(|(band, filters)| {
            let filter = filters.choose(rng).copied().unwrap_or(band);
            // blue bands are fainter and more extincted, infrared brighter and cleaner
            let (magnitude, extinction) = match band {
                "U" | "B" => (rng.gen_range(18.0..22.0), rng.gen_range(0.05..0.2)),
                "V" | "R" | "I" => (rng.gen_range(17.0..21.0), rng.gen_range(0.02..0.1)),
                _ => (rng.gen_range(15.0..19.0), rng.gen_range(0.0..0.03)),
            };
            PhotometryRecord {
                band_label: Some(band.to_string()),
                filter_name: Some(filter.to_string()),
                mag_value: Some(magnitude),
                mag_error: Some(0.01 + (magnitude - 15.0) * 0.005),
                extinction: Some(extinction),
            }
        })
        .collect()
}

fn demo_redshift(rng: &mut ChaCha8Rng) -> RedshiftRecord {
    let spectroscopic = rng.gen_bool(0.6);
    // log-normal around z = 0.37, via Box-Muller
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.r#gen();
    let normal = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
    let z = (normal - 1.0).exp().clamp(0.02, 3.0);
    let (kind, relative_error) = if spectroscopic {
        (REDSHIFT_TYPES[0], rng.gen_range(0.001..0.01))
    } else {
        (REDSHIFT_TYPES[1], rng.gen_range(0.05..0.15))
    };
    RedshiftRecord {
        redshift_type: Some(kind.to_string()),
        z_value: Some(z),
        z_error: Some(z * relative_error),
    }
}

fn demo_classification(rng: &mut ChaCha8Rng) -> ClassificationRecord {
    let owned = |s: &str| Some(s.to_string());
    if rng.gen_bool(0.5) {
        let class = ["Seyfert 1", "Seyfert 1.5", "Quasar"]
            .choose(rng)
            .copied()
            .unwrap_or(BEST_CLASSES[0]);
        ClassificationRecord {
            spec_class: if rng.gen_bool(0.9) { owned("BLAGN") } else { None },
            gen_class: owned(class),
            xray_class: owned("Type 1"),
            best_class: owned(class),
            image_class: owned(if rng.gen_bool(0.8) { "Point Source" } else { "Extended" }),
            sed_class: owned(if rng.gen_bool(0.7) {
                "Blue Continuum"
            } else if rng.gen_bool(0.5) {
                "Red Continuum"
            } else {
                "Flat Continuum"
            }),
        }
    } else {
        let class = if rng.gen_bool(0.7) {
            if rng.gen_bool(0.5) { "Seyfert 2" } else { "LINER" }
        } else {
            "AGN Candidate"
        };
        ClassificationRecord {
            spec_class: if rng.gen_bool(0.7) { owned("NLAGN") } else { None },
            gen_class: owned(class),
            xray_class: owned("Type 2"),
            best_class: owned(class),
            image_class: owned(if rng.gen_bool(0.9) { "Extended" } else { "Point Source" }),
            sed_class: owned(if rng.gen_bool(0.7) {
                "Red Continuum"
            } else if rng.gen_bool(0.5) {
                "Blue Continuum"
            } else {
                "Flat Continuum"
            }),
        }
    }
}
