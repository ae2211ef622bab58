//! Catalog entities
//!
//! Colors, categories, item types and items are created in bulk by one atomic
//! catalog load and are immutable afterwards, except for the two relationship
//! attachments on [`Item`] (`consists_of`, `appears_in`) which are populated
//! post-load. All binary layouts are little-endian and live inside the chunk
//! payloads written by [`crate::catalog::Catalog`].

use crate::chunk::{ChunkReader, ChunkWriter};
use crate::error::Result;
use std::cmp::Ordering;
use std::io::{Read, Seek, Write};

/// Key of an [`Item`]: the single-character item-type id plus the textual
/// item id (e.g. `('P', "3001")`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey {
    pub type_id: char,
    pub id: String,
}

impl ItemKey {
    pub fn new(type_id: char, id: impl Into<String>) -> Self {
        ItemKey {
            type_id,
            id: id.into(),
        }
    }
}

const COLOR_TRANSPARENT: u8 = 1 << 0;
const COLOR_GLITTER: u8 = 1 << 1;
const COLOR_SPECKLE: u8 = 1 << 2;
const COLOR_METALLIC: u8 = 1 << 3;
const COLOR_CHROME: u8 = 1 << 4;

/// A catalog color, keyed by integer id
#[derive(Debug, Clone, PartialEq)]
pub struct Color {
    pub id: u32,
    pub name: String,
    pub ldraw_id: Option<i32>,
    pub rgb: u32,
    flags: u8,
}

impl Color {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Color {
            id,
            name: name.into(),
            ldraw_id: None,
            rgb: 0,
            flags: 0,
        }
    }

    pub fn is_transparent(&self) -> bool {
        self.flags & COLOR_TRANSPARENT != 0
    }

    pub fn is_glitter(&self) -> bool {
        self.flags & COLOR_GLITTER != 0
    }

    pub fn is_speckle(&self) -> bool {
        self.flags & COLOR_SPECKLE != 0
    }

    pub fn is_metallic(&self) -> bool {
        self.flags & COLOR_METALLIC != 0
    }

    pub fn is_chrome(&self) -> bool {
        self.flags & COLOR_CHROME != 0
    }

    pub fn set_transparent(&mut self, on: bool) {
        self.set_flag(COLOR_TRANSPARENT, on);
    }

    pub fn set_glitter(&mut self, on: bool) {
        self.set_flag(COLOR_GLITTER, on);
    }

    pub fn set_speckle(&mut self, on: bool) {
        self.set_flag(COLOR_SPECKLE, on);
    }

    pub fn set_metallic(&mut self, on: bool) {
        self.set_flag(COLOR_METALLIC, on);
    }

    pub fn set_chrome(&mut self, on: bool) {
        self.set_flag(COLOR_CHROME, on);
    }

    fn set_flag(&mut self, flag: u8, on: bool) {
        if on {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }

    pub(crate) fn decode<R: Read + Seek>(r: &mut ChunkReader<R>) -> Result<Self> {
        let id = r.read_u32()?;
        let name = r.read_string()?;
        let ldraw = r.read_i32()?;
        let rgb = r.read_u32()?;
        let flags = r.read_u8()?;
        Ok(Color {
            id,
            name,
            ldraw_id: (ldraw >= 0).then_some(ldraw),
            rgb,
            flags,
        })
    }

    pub(crate) fn encode<W: Write + Seek>(&self, w: &mut ChunkWriter<W>) -> Result<()> {
        w.write_u32(self.id)?;
        w.write_string(&self.name)?;
        w.write_i32(self.ldraw_id.unwrap_or(-1))?;
        w.write_u32(self.rgb)?;
        w.write_u8(self.flags)
    }
}

/// A catalog category, keyed by integer id
#[derive(Debug, Clone, PartialEq)]
pub struct Category {
    pub id: u32,
    pub name: String,
}

impl Category {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Category {
            id,
            name: name.into(),
        }
    }

    pub(crate) fn decode<R: Read + Seek>(r: &mut ChunkReader<R>) -> Result<Self> {
        Ok(Category {
            id: r.read_u32()?,
            name: r.read_string()?,
        })
    }

    pub(crate) fn encode<W: Write + Seek>(&self, w: &mut ChunkWriter<W>) -> Result<()> {
        w.write_u32(self.id)?;
        w.write_string(&self.name)
    }
}

const ITT_HAS_INVENTORIES: u8 = 1 << 0;
const ITT_HAS_COLORS: u8 = 1 << 1;
const ITT_HAS_WEIGHT: u8 = 1 << 2;
const ITT_HAS_YEAR: u8 = 1 << 3;

/// An item type (part, set, minifig, ...), keyed by a single-character id
#[derive(Debug, Clone, PartialEq)]
pub struct ItemType {
    pub id: char,
    pub name: String,
    /// character used in picture URLs, usually equal to `id`
    pub picture_id: char,
    pub categories: Vec<u32>,
    flags: u8,
}

impl ItemType {
    pub fn new(id: char, name: impl Into<String>) -> Self {
        ItemType {
            id,
            name: name.into(),
            picture_id: id,
            categories: Vec::new(),
            flags: 0,
        }
    }

    pub fn has_inventories(&self) -> bool {
        self.flags & ITT_HAS_INVENTORIES != 0
    }

    pub fn has_colors(&self) -> bool {
        self.flags & ITT_HAS_COLORS != 0
    }

    pub fn has_weight(&self) -> bool {
        self.flags & ITT_HAS_WEIGHT != 0
    }

    pub fn has_year(&self) -> bool {
        self.flags & ITT_HAS_YEAR != 0
    }

    pub fn set_has_inventories(&mut self, on: bool) {
        self.set_flag(ITT_HAS_INVENTORIES, on);
    }

    pub fn set_has_colors(&mut self, on: bool) {
        self.set_flag(ITT_HAS_COLORS, on);
    }

    pub fn set_has_weight(&mut self, on: bool) {
        self.set_flag(ITT_HAS_WEIGHT, on);
    }

    pub fn set_has_year(&mut self, on: bool) {
        self.set_flag(ITT_HAS_YEAR, on);
    }

    fn set_flag(&mut self, flag: u8, on: bool) {
        if on {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }

    pub(crate) fn decode<R: Read + Seek>(r: &mut ChunkReader<R>) -> Result<Self> {
        let id = r.read_u8()? as char;
        let picture_id = r.read_u8()? as char;
        let name = r.read_string()?;
        let flags = r.read_u8()?;
        let count = r.read_u32()? as usize;
        let mut categories = Vec::with_capacity(count);
        for _ in 0..count {
            categories.push(r.read_u32()?);
        }
        Ok(ItemType {
            id,
            name,
            picture_id,
            categories,
            flags,
        })
    }

    pub(crate) fn encode<W: Write + Seek>(&self, w: &mut ChunkWriter<W>) -> Result<()> {
        w.write_u8(self.id as u8)?;
        w.write_u8(self.picture_id as u8)?;
        w.write_string(&self.name)?;
        w.write_u8(self.flags)?;
        w.write_u32(self.categories.len() as u32)?;
        for cat in &self.categories {
            w.write_u32(*cat)?;
        }
        Ok(())
    }
}

/// One line of an item's inventory ("consists of")
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRef {
    pub quantity: u32,
    /// index into the sorted item table of the owning catalog generation
    pub item_index: u32,
    pub color_id: u32,
}

/// A set this item appears in ("appears in")
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppearsIn {
    pub quantity: u32,
    /// index into the sorted item table of the owning catalog generation
    pub item_index: u32,
}

/// A catalog item, keyed by `(item-type id, item id)`
///
/// Item type and category are referenced by id and resolved lazily at lookup
/// time, never stored as embedded pointers.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub id: String,
    pub name: String,
    pub item_type_id: char,
    pub category_id: u32,
    /// default color, if the item type has colors
    pub color_id: Option<u32>,
    pub inventory_updated: Option<i64>,
    pub weight: f32,
    pub year: u16,
    consists_of: Vec<PartRef>,
    appears_in: Vec<AppearsIn>,
}

impl Item {
    pub fn new(item_type_id: char, id: impl Into<String>, name: impl Into<String>) -> Self {
        Item {
            id: id.into(),
            name: name.into(),
            item_type_id,
            category_id: 0,
            color_id: None,
            inventory_updated: None,
            weight: 0.0,
            year: 0,
            consists_of: Vec::new(),
            appears_in: Vec::new(),
        }
    }

    pub fn key(&self) -> ItemKey {
        ItemKey::new(self.item_type_id, self.id.clone())
    }

    pub fn consists_of(&self) -> &[PartRef] {
        &self.consists_of
    }

    pub fn appears_in(&self) -> &[AppearsIn] {
        &self.appears_in
    }

    /// Attach the inventory relationship; the only post-load mutation besides
    /// [`Item::set_appears_in`].
    pub fn set_consists_of(&mut self, parts: Vec<PartRef>) {
        self.consists_of = parts;
    }

    pub fn set_appears_in(&mut self, sets: Vec<AppearsIn>) {
        self.appears_in = sets;
    }

    /// Ordering used by the sorted item table: type id first, then item id.
    pub fn cmp_key(&self, type_id: char, id: &str) -> Ordering {
        self.item_type_id
            .cmp(&type_id)
            .then_with(|| self.id.as_str().cmp(id))
    }

    pub(crate) fn decode<R: Read + Seek>(r: &mut ChunkReader<R>) -> Result<Self> {
        let item_type_id = r.read_u8()? as char;
        let id = r.read_string()?;
        let name = r.read_string()?;
        let category_id = r.read_u32()?;
        let color_id = match r.read_u8()? {
            0 => None,
            _ => Some(r.read_u32()?),
        };
        let inventory_updated = match r.read_u8()? {
            0 => None,
            _ => Some(r.read_i64()?),
        };
        let weight = r.read_f32()?;
        let year = r.read_u16()?;

        let count = r.read_u32()? as usize;
        let mut consists_of = Vec::with_capacity(count);
        for _ in 0..count {
            consists_of.push(PartRef {
                quantity: r.read_u32()?,
                item_index: r.read_u32()?,
                color_id: r.read_u32()?,
            });
        }

        let count = r.read_u32()? as usize;
        let mut appears_in = Vec::with_capacity(count);
        for _ in 0..count {
            appears_in.push(AppearsIn {
                quantity: r.read_u32()?,
                item_index: r.read_u32()?,
            });
        }

        Ok(Item {
            id,
            name,
            item_type_id,
            category_id,
            color_id,
            inventory_updated,
            weight,
            year,
            consists_of,
            appears_in,
        })
    }

    pub(crate) fn encode<W: Write + Seek>(&self, w: &mut ChunkWriter<W>) -> Result<()> {
        w.write_u8(self.item_type_id as u8)?;
        w.write_string(&self.id)?;
        w.write_string(&self.name)?;
        w.write_u32(self.category_id)?;
        // optional fields carry a presence tag so every in-range value,
        // zero included, survives the round trip
        match self.color_id {
            Some(color) => {
                w.write_u8(1)?;
                w.write_u32(color)?;
            }
            None => w.write_u8(0)?,
        }
        match self.inventory_updated {
            Some(stamp) => {
                w.write_u8(1)?;
                w.write_i64(stamp)?;
            }
            None => w.write_u8(0)?,
        }
        w.write_f32(self.weight)?;
        w.write_u16(self.year)?;

        w.write_u32(self.consists_of.len() as u32)?;
        for part in &self.consists_of {
            w.write_u32(part.quantity)?;
            w.write_u32(part.item_index)?;
            w.write_u32(part.color_id)?;
        }

        w.write_u32(self.appears_in.len() as u32)?;
        for set in &self.appears_in {
            w.write_u32(set.quantity)?;
            w.write_u32(set.item_index)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{chunk_id, ChunkReader, ChunkWriter};
    use std::io::Cursor;

    const TEST: u32 = chunk_id(b"TEST");

    fn roundtrip<T, E, D>(value: &T, encode: E, decode: D) -> T
    where
        E: Fn(&T, &mut ChunkWriter<Cursor<Vec<u8>>>) -> Result<()>,
        D: Fn(&mut ChunkReader<Cursor<Vec<u8>>>) -> Result<T>,
    {
        let mut w = ChunkWriter::new(Cursor::new(Vec::new()));
        w.start_chunk(TEST, 1).unwrap();
        encode(value, &mut w).unwrap();
        w.end_chunk().unwrap();
        let bytes = w.finish().unwrap().into_inner();

        let mut r = ChunkReader::new(Cursor::new(bytes));
        r.start_chunk().unwrap().unwrap();
        let decoded = decode(&mut r).unwrap();
        r.end_chunk().unwrap();
        decoded
    }

    #[test]
    fn test_color_roundtrip() {
        let mut color = Color::new(5, "Green");
        color.ldraw_id = Some(2);
        color.rgb = 0x00_7b_28;
        color.set_transparent(true);
        color.set_metallic(true);

        let back = roundtrip(&color, Color::encode, Color::decode);
        assert_eq!(back, color);
        assert!(back.is_transparent());
        assert!(back.is_metallic());
        assert!(!back.is_chrome());
    }

    #[test]
    fn test_item_type_roundtrip() {
        let mut itt = ItemType::new('P', "Part");
        itt.set_has_colors(true);
        itt.set_has_weight(true);
        itt.categories = vec![5, 10, 123];

        let back = roundtrip(&itt, ItemType::encode, ItemType::decode);
        assert_eq!(back, itt);
    }

    #[test]
    fn test_item_roundtrip_with_relationships() {
        let mut item = Item::new('S', "7190-1", "Millennium Falcon");
        item.category_id = 65;
        item.weight = 1432.5;
        item.year = 2000;
        item.inventory_updated = Some(1_680_000_000);
        item.set_consists_of(vec![PartRef {
            quantity: 4,
            item_index: 17,
            color_id: 11,
        }]);
        item.set_appears_in(vec![AppearsIn {
            quantity: 1,
            item_index: 99,
        }]);

        let back = roundtrip(&item, Item::encode, Item::decode);
        assert_eq!(back, item);
    }

    #[test]
    fn test_item_optional_fields_survive_boundary_values() {
        // zero is a legitimate inventory timestamp, not "absent"
        let mut item = Item::new('P', "3001", "Brick 2 x 4");
        item.inventory_updated = Some(0);
        item.color_id = Some(u32::MAX);
        let back = roundtrip(&item, Item::encode, Item::decode);
        assert_eq!(back.inventory_updated, Some(0));
        assert_eq!(back.color_id, Some(u32::MAX));

        let mut absent = Item::new('P', "3002", "Brick 2 x 2");
        absent.inventory_updated = None;
        absent.color_id = None;
        let back = roundtrip(&absent, Item::encode, Item::decode);
        assert_eq!(back.inventory_updated, None);
        assert_eq!(back.color_id, None);
    }

    #[test]
    fn test_item_key_ordering() {
        let mut keys = vec![
            ItemKey::new('S', "100"),
            ItemKey::new('P', "3001"),
            ItemKey::new('P', "3002"),
        ];
        keys.sort();
        assert_eq!(keys[0].type_id, 'P');
        assert_eq!(keys[2].type_id, 'S');
    }
}
