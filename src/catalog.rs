//! The catalog store
//!
//! Owns the four sorted entity tables (colors, categories, item types, items)
//! plus the all-time price guide blob, and persists them in the chunked
//! container format (or the legacy flat layout kept for migration). A load
//! builds into temporary tables and swaps them in only on full success, so a
//! corrupt file never leaves a half-populated catalog behind.

use crate::chunk::{chunk_id, ChunkReader, ChunkWriter};
use crate::error::{Error, Result};
use crate::types::{Category, Color, Item, ItemType, PartRef};
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, info};

pub const CONTAINER_ID: u32 = chunk_id(b"BSDB");
pub const CONTAINER_VERSION: u32 = 1;

const COLORS_ID: u32 = chunk_id(b"COL ");
const CATEGORIES_ID: u32 = chunk_id(b"CAT ");
const ITEM_TYPES_ID: u32 = chunk_id(b"TYPE");
const ITEMS_ID: u32 = chunk_id(b"ITEM");
const ALLTIME_PG_ID: u32 = chunk_id(b"ATPG");

/// Magic number of the legacy flat database layout
pub const LEGACY_MAGIC: u32 = 0xb91c5703;
const LEGACY_VERSION: u32 = 0;

/// Container layout selected when saving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatVersion {
    /// Linear magic/size/version header, no nesting. Read support is needed
    /// for migrating old data directories.
    LegacyFlat,
    /// Nested chunked container, the current format.
    Chunked,
}

/// In-memory catalog: one immutable generation of the four entity tables
#[derive(Debug, Default)]
pub struct Catalog {
    colors: Vec<Color>,
    categories: Vec<Category>,
    item_types: Vec<ItemType>,
    items: Vec<Item>,
    alltime_price_guide: Vec<u8>,
}

impl Catalog {
    pub fn new() -> Self {
        Catalog::default()
    }

    /// Replace all tables wholesale. Tables are re-sorted by key; this is the
    /// only way entities enter the catalog.
    pub fn replace(
        &mut self,
        mut colors: Vec<Color>,
        mut categories: Vec<Category>,
        mut item_types: Vec<ItemType>,
        mut items: Vec<Item>,
        alltime_price_guide: Vec<u8>,
    ) {
        colors.sort_by_key(|c| c.id);
        categories.sort_by_key(|c| c.id);
        item_types.sort_by_key(|t| t.id);
        items.sort_by(|a, b| a.cmp_key(b.item_type_id, &b.id));

        self.colors = colors;
        self.categories = categories;
        self.item_types = item_types;
        self.items = items;
        self.alltime_price_guide = alltime_price_guide;
    }

    pub fn colors(&self) -> &[Color] {
        &self.colors
    }

    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    pub fn item_types(&self) -> &[ItemType] {
        &self.item_types
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn alltime_price_guide(&self) -> &[u8] {
        &self.alltime_price_guide
    }

    pub fn color(&self, id: u32) -> Option<&Color> {
        self.colors
            .binary_search_by_key(&id, |c| c.id)
            .ok()
            .map(|i| &self.colors[i])
    }

    pub fn category(&self, id: u32) -> Option<&Category> {
        self.categories
            .binary_search_by_key(&id, |c| c.id)
            .ok()
            .map(|i| &self.categories[i])
    }

    pub fn item_type(&self, id: char) -> Option<&ItemType> {
        self.item_types
            .binary_search_by_key(&id, |t| t.id)
            .ok()
            .map(|i| &self.item_types[i])
    }

    pub fn item(&self, type_id: char, id: &str) -> Option<&Item> {
        self.item_index(type_id, id).map(|i| &self.items[i])
    }

    /// Try an ordered list of candidate type ids; first match wins. Used for
    /// ambiguous external references that only carry an item id.
    pub fn item_any(&self, type_ids: &[char], id: &str) -> Option<&Item> {
        type_ids.iter().find_map(|&tid| self.item(tid, id))
    }

    pub fn item_index(&self, type_id: char, id: &str) -> Option<usize> {
        self.items
            .binary_search_by(|item| item.cmp_key(type_id, id))
            .ok()
    }

    /// Case-insensitive exact name match; linear scan over the small table.
    pub fn color_by_name(&self, name: &str) -> Option<&Color> {
        if name.is_empty() {
            return None;
        }
        self.colors.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn color_by_ldraw_id(&self, ldraw_id: i32) -> Option<&Color> {
        self.colors.iter().find(|c| c.ldraw_id == Some(ldraw_id))
    }

    /// Attach the inventory relationship to an item post-load.
    pub fn set_item_consists_of(&mut self, index: usize, parts: Vec<PartRef>) {
        self.items[index].set_consists_of(parts);
    }

    /// Attach the appears-in relationship to an item post-load.
    pub fn set_item_appears_in(&mut self, index: usize, sets: Vec<crate::types::AppearsIn>) {
        self.items[index].set_appears_in(sets);
    }

    /// Load a catalog file, detecting the chunked container by its outer id
    /// and falling back to the legacy flat layout. On any failure the current
    /// tables are left untouched.
    pub fn load(&mut self, path: &Path) -> Result<()> {
        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)
            .map_err(|e| Error::MalformedStream(e.to_string()))?;
        file.seek(SeekFrom::Start(0))?;
        let mut reader = ChunkReader::new(BufReader::new(file));

        let loaded = if u32::from_le_bytes(magic) == LEGACY_MAGIC {
            Self::load_legacy(&mut reader, file_size)?
        } else {
            Self::load_chunked(&mut reader)?
        };

        info!(
            colors = loaded.colors.len(),
            categories = loaded.categories.len(),
            item_types = loaded.item_types.len(),
            items = loaded.items.len(),
            alltime_bytes = loaded.alltime_price_guide.len(),
            "catalog loaded"
        );

        *self = loaded;
        Ok(())
    }

    fn load_chunked<R: std::io::Read + Seek>(reader: &mut ChunkReader<R>) -> Result<Catalog> {
        match reader.start_chunk()? {
            Some((CONTAINER_ID, CONTAINER_VERSION)) => {}
            Some((id, version)) => return Err(Error::UnsupportedFormat { id, version }),
            None => return Err(Error::MalformedStream("empty container".into())),
        }

        let mut catalog = Catalog::new();

        while let Some((id, version)) = reader.start_chunk()? {
            match (id, version) {
                (COLORS_ID, 1) => {
                    let count = reader.read_u32()?;
                    catalog.colors.reserve(count as usize);
                    for _ in 0..count {
                        catalog.colors.push(Color::decode(reader)?);
                    }
                    reader.end_chunk()?;
                }
                (CATEGORIES_ID, 1) => {
                    let count = reader.read_u32()?;
                    catalog.categories.reserve(count as usize);
                    for _ in 0..count {
                        catalog.categories.push(Category::decode(reader)?);
                    }
                    reader.end_chunk()?;
                }
                (ITEM_TYPES_ID, 1) => {
                    let count = reader.read_u32()?;
                    catalog.item_types.reserve(count as usize);
                    for _ in 0..count {
                        catalog.item_types.push(ItemType::decode(reader)?);
                    }
                    reader.end_chunk()?;
                }
                (ITEMS_ID, 1) => {
                    let count = reader.read_u32()?;
                    catalog.items.reserve(count as usize);
                    for _ in 0..count {
                        catalog.items.push(Item::decode(reader)?);
                    }
                    reader.end_chunk()?;
                }
                (ALLTIME_PG_ID, 1) => {
                    let len = reader.read_u32()?;
                    catalog.alltime_price_guide = reader.read_bytes(len as usize)?;
                    reader.end_chunk()?;
                }
                _ => {
                    debug!(id, version, "skipping unknown catalog chunk");
                    reader.skip_chunk()?;
                }
            }
        }
        reader.end_chunk()?;

        catalog.sort_tables();
        Ok(catalog)
    }

    fn load_legacy<R: std::io::Read + Seek>(
        reader: &mut ChunkReader<R>,
        file_size: u64,
    ) -> Result<Catalog> {
        let magic = reader.read_u32()?;
        let size = reader.read_u32()?;
        let version = reader.read_u32()?;

        if magic != LEGACY_MAGIC || version != LEGACY_VERSION {
            return Err(Error::UnsupportedFormat { id: magic, version });
        }
        if u64::from(size) != file_size {
            return Err(Error::MalformedStream(format!(
                "legacy header claims {size} bytes, file has {file_size}"
            )));
        }

        let mut catalog = Catalog::new();

        let color_count = reader.read_u32()?;
        for _ in 0..color_count {
            catalog.colors.push(Color::decode(reader)?);
        }
        let category_count = reader.read_u32()?;
        for _ in 0..category_count {
            catalog.categories.push(Category::decode(reader)?);
        }
        let type_count = reader.read_u32()?;
        for _ in 0..type_count {
            catalog.item_types.push(ItemType::decode(reader)?);
        }
        let item_count = reader.read_u32()?;
        for _ in 0..item_count {
            catalog.items.push(Item::decode(reader)?);
        }

        let check = reader.read_u32()?;
        let end_magic = reader.read_u32()?;
        if check != color_count + category_count + type_count + item_count
            || end_magic != LEGACY_MAGIC
        {
            return Err(Error::MalformedStream(
                "legacy trailing checksum mismatch".into(),
            ));
        }

        catalog.sort_tables();
        Ok(catalog)
    }

    fn sort_tables(&mut self) {
        self.colors.sort_by_key(|c| c.id);
        self.categories.sort_by_key(|c| c.id);
        self.item_types.sort_by_key(|t| t.id);
        self.items.sort_by(|a, b| a.cmp_key(b.item_type_id, &b.id));
    }

    /// Write the catalog in the requested layout, persisted via write-to-temp
    /// plus atomic rename so a crash mid-write cannot corrupt a previous file.
    pub fn save(&self, path: &Path, version: FormatVersion) -> Result<()> {
        let tmp_path = path.with_extension("new");
        match version {
            FormatVersion::Chunked => {
                let file = File::create(&tmp_path)?;
                let mut writer = ChunkWriter::new(BufWriter::new(file));
                self.save_chunked(&mut writer)?;
                let mut buf = writer.finish()?;
                buf.flush()?;
            }
            FormatVersion::LegacyFlat => {
                let mut writer = ChunkWriter::new(Cursor::new(Vec::new()));
                self.save_legacy(&mut writer)?;
                let mut bytes = writer.finish()?.into_inner();
                // patch the file size field right after the magic
                let total = bytes.len() as u32;
                bytes[4..8].copy_from_slice(&total.to_le_bytes());
                std::fs::write(&tmp_path, &bytes)?;
            }
        }
        std::fs::rename(&tmp_path, path)?;
        debug!(path = %path.display(), ?version, "catalog saved");
        Ok(())
    }

    fn save_chunked<W: std::io::Write + Seek>(&self, writer: &mut ChunkWriter<W>) -> Result<()> {
        writer.start_chunk(CONTAINER_ID, CONTAINER_VERSION)?;

        writer.start_chunk(COLORS_ID, 1)?;
        writer.write_u32(self.colors.len() as u32)?;
        for color in &self.colors {
            color.encode(writer)?;
        }
        writer.end_chunk()?;

        writer.start_chunk(CATEGORIES_ID, 1)?;
        writer.write_u32(self.categories.len() as u32)?;
        for category in &self.categories {
            category.encode(writer)?;
        }
        writer.end_chunk()?;

        writer.start_chunk(ITEM_TYPES_ID, 1)?;
        writer.write_u32(self.item_types.len() as u32)?;
        for item_type in &self.item_types {
            item_type.encode(writer)?;
        }
        writer.end_chunk()?;

        writer.start_chunk(ITEMS_ID, 1)?;
        writer.write_u32(self.items.len() as u32)?;
        for item in &self.items {
            item.encode(writer)?;
        }
        writer.end_chunk()?;

        writer.start_chunk(ALLTIME_PG_ID, 1)?;
        writer.write_u32(self.alltime_price_guide.len() as u32)?;
        writer.write_bytes(&self.alltime_price_guide)?;
        writer.end_chunk()?;

        writer.end_chunk()
    }

    fn save_legacy<W: Write + Seek>(&self, writer: &mut ChunkWriter<W>) -> Result<()> {
        writer.write_u32(LEGACY_MAGIC)?;
        writer.write_u32(0)?; // file size, patched by the caller
        writer.write_u32(LEGACY_VERSION)?;

        writer.write_u32(self.colors.len() as u32)?;
        for color in &self.colors {
            color.encode(writer)?;
        }
        writer.write_u32(self.categories.len() as u32)?;
        for category in &self.categories {
            category.encode(writer)?;
        }
        writer.write_u32(self.item_types.len() as u32)?;
        for item_type in &self.item_types {
            item_type.encode(writer)?;
        }
        writer.write_u32(self.items.len() as u32)?;
        for item in &self.items {
            item.encode(writer)?;
        }

        let total = (self.colors.len()
            + self.categories.len()
            + self.item_types.len()
            + self.items.len()) as u32;
        writer.write_u32(total)?;
        writer.write_u32(LEGACY_MAGIC)?;
        Ok(())
    }
}
