//! Price guides
//!
//! A price guide summarizes market prices for one `(item, color)` pair across
//! two time bands (past six months of sales, current inventory) and two
//! conditions (new, used). The network payload is a tab-separated summary,
//! one line per band/condition; the disk cache keeps a `priceguide.bin`
//! bincode sidecar holding the fetch timestamp next to the decoded table.

use crate::cache::{Cached, CachedHandle};
use crate::error::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

pub const PRICE_GUIDE_FILE: &str = "priceguide.bin";

/// Cost of one price guide in its cache: every entry counts the same.
pub const PRICE_GUIDE_COST: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBand {
    PastSales,
    CurrentInventory,
}

impl TimeBand {
    pub const ALL: [TimeBand; 2] = [TimeBand::PastSales, TimeBand::CurrentInventory];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    New,
    Used,
}

impl Condition {
    pub const ALL: [Condition; 2] = [Condition::New, Condition::Used];
}

/// One band/condition cell of the summary table
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceBand {
    pub lots: u32,
    pub quantity: u32,
    pub min: f64,
    pub avg: f64,
    pub weighted_avg: f64,
    pub max: f64,
}

/// The full 2x2 summary table
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceGuideData {
    bands: [[PriceBand; 2]; 2],
}

impl PriceGuideData {
    pub fn band(&self, time: TimeBand, condition: Condition) -> &PriceBand {
        &self.bands[index(time)][index_cond(condition)]
    }

    pub fn band_mut(&mut self, time: TimeBand, condition: Condition) -> &mut PriceBand {
        &mut self.bands[index(time)][index_cond(condition)]
    }
}

fn index(time: TimeBand) -> usize {
    match time {
        TimeBand::PastSales => 0,
        TimeBand::CurrentInventory => 1,
    }
}

fn index_cond(condition: Condition) -> usize {
    match condition {
        Condition::New => 0,
        Condition::Used => 1,
    }
}

pub type PriceGuide = Cached<PriceGuideData>;
pub type PriceGuideHandle = CachedHandle<PriceGuideData>;

/// Parse the network summary: four lines in band-major order (past-sales new,
/// past-sales used, current new, current used), each with six tab-separated
/// fields (lots, quantity, min, avg, weighted avg, max).
pub fn decode_summary(bytes: &[u8]) -> Result<PriceGuideData> {
    let text = std::str::from_utf8(bytes).map_err(|e| Error::Decode(e.to_string()))?;
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());

    let mut data = PriceGuideData::default();
    for time in TimeBand::ALL {
        for condition in Condition::ALL {
            let line = lines
                .next()
                .ok_or_else(|| Error::Decode("price summary is missing lines".into()))?;
            *data.band_mut(time, condition) = decode_band(line)?;
        }
    }
    Ok(data)
}

fn decode_band(line: &str) -> Result<PriceBand> {
    let mut fields = line.split('\t');
    let mut next = || {
        fields
            .next()
            .ok_or_else(|| Error::Decode(format!("short price summary line: {line:?}")))
    };
    Ok(PriceBand {
        lots: parse(next()?)?,
        quantity: parse(next()?)?,
        min: parse(next()?)?,
        avg: parse(next()?)?,
        weighted_avg: parse(next()?)?,
        max: parse(next()?)?,
    })
}

fn parse<T: std::str::FromStr>(field: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    field
        .trim()
        .parse()
        .map_err(|e| Error::Decode(format!("bad price summary field {field:?}: {e}")))
}

#[derive(Serialize, Deserialize)]
struct Sidecar {
    fetched: i64,
    data: PriceGuideData,
}

/// Read the disk-cache sidecar. `Ok(None)` when no file exists; a sidecar
/// that fails to decode is treated the same way (and removed), since the
/// object will simply be re-fetched.
pub fn load_from_disk(path: &Path) -> Result<Option<(DateTime<Utc>, PriceGuideData)>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let sidecar: Sidecar = match bincode::deserialize(&bytes) {
        Ok(sidecar) => sidecar,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "discarding undecodable price guide sidecar");
            let _ = std::fs::remove_file(path);
            return Ok(None);
        }
    };
    let fetched = Utc
        .timestamp_opt(sidecar.fetched, 0)
        .single()
        .unwrap_or_else(Utc::now);
    Ok(Some((fetched, sidecar.data)))
}

pub fn save_to_disk(path: &Path, fetched: DateTime<Utc>, data: &PriceGuideData) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let sidecar = Sidecar {
        fetched: fetched.timestamp(),
        data: *data,
    };
    let bytes = bincode::serialize(&sidecar).map_err(|e| Error::Decode(e.to_string()))?;
    std::fs::write(path, bytes)?;
    Ok(())
}
