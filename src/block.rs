//! Block metadata: the immutable unit of stored profiling data.
//!
//! A block is one object in object storage. It holds one or more tenant
//! services, each laid out as a run of sections addressed by a table of
//! contents. The metastore never reads block bodies; it only schedules them.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

/// Metadata describing one immutable block.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    /// Layout version of the block object.
    pub format_version: u32,
    /// ULID of the block.
    pub id: String,
    /// Earliest sample timestamp (milliseconds).
    pub min_time: i64,
    /// Latest sample timestamp (milliseconds).
    pub max_time: i64,
    /// Shard the block was written to.
    pub shard: u32,
    /// Compaction generation; 0 for freshly ingested blocks.
    pub compaction_level: u32,
    /// Owning tenant. Empty for level-0 blocks that mix tenants.
    pub tenant_id: String,
    /// Object size in bytes.
    pub size: u64,
    /// Per tenant-service sections stored in the object.
    pub tenant_services: Vec<TenantService>,
}

impl BlockMeta {
    /// Build metadata for a new block with a freshly generated id.
    pub fn new(shard: u32, compaction_level: u32, size: u64) -> Self {
        Self {
            id: Ulid::new().to_string(),
            shard,
            compaction_level,
            size,
            ..Self::default()
        }
    }

    /// Set the owning tenant.
    pub fn with_tenant(self, tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            ..self
        }
    }

    /// Set the covered time range.
    pub fn with_time_range(self, min_time: i64, max_time: i64) -> Self {
        Self {
            min_time,
            max_time,
            ..self
        }
    }

    /// Attach a tenant service section run.
    pub fn with_tenant_service(mut self, service: TenantService) -> Self {
        self.tenant_services.push(service);
        self
    }

    /// Returns `true` if the id parses as a ULID.
    pub fn has_valid_id(&self) -> bool {
        Ulid::from_string(&self.id).is_ok()
    }
}

/// Sum of block sizes in bytes.
pub fn total_size(blocks: &[BlockMeta]) -> u64 {
    blocks
        .iter()
        .fold(0u64, |acc, block| acc.saturating_add(block.size))
}

/// Data of a single tenant service stored within a block.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantService {
    /// Tenant owning the service data.
    pub tenant_id: String,
    /// Service name.
    pub name: String,
    /// Earliest sample timestamp (milliseconds).
    pub min_time: i64,
    /// Latest sample timestamp (milliseconds).
    pub max_time: i64,
    /// Size of the service data in bytes, across all sections.
    pub size: u64,
    /// Absolute object offsets of each section, in layout order.
    pub table_of_contents: Vec<u64>,
}

/// Sections a tenant service is made of.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Section {
    /// Profile rows (columnar).
    Profiles,
    /// Series index.
    Tsdb,
    /// Symbol tables.
    Symbols,
}

impl Section {
    /// Human readable section name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Profiles => "profiles.parquet",
            Self::Tsdb => "index.tsdb",
            Self::Symbols => "symbols.symdb",
        }
    }
}

const SECTIONS_V1: &[Section] = &[Section::Profiles, Section::Tsdb, Section::Symbols];

/// Layouts per format version. Unknown versions fall back to v1.
const SECTION_LAYOUTS: &[(u32, &[Section])] = &[(1, SECTIONS_V1)];

fn section_layout(format_version: u32) -> &'static [Section] {
    SECTION_LAYOUTS
        .iter()
        .find(|(version, _)| *version == format_version)
        .map(|(_, layout)| *layout)
        .unwrap_or(SECTIONS_V1)
}

/// Errors raised while resolving sections of a tenant service.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockError {
    /// The table of contents has no entry for the section.
    #[error("table of contents has {entries} entries, section {} is missing", .section.name())]
    MissingSection {
        /// Requested section.
        section: Section,
        /// Number of table-of-contents entries.
        entries: usize,
    },
}

impl TenantService {
    /// Offset of the tenant service within the object.
    pub fn offset(&self) -> Option<u64> {
        self.table_of_contents.first().copied()
    }

    fn section_index(&self, format_version: u32, section: Section) -> Result<usize, BlockError> {
        section_layout(format_version)
            .iter()
            .position(|candidate| *candidate == section)
            .filter(|index| *index < self.table_of_contents.len())
            .ok_or(BlockError::MissingSection {
                section,
                entries: self.table_of_contents.len(),
            })
    }

    /// Absolute offset of `section` within the object.
    pub fn section_offset(&self, format_version: u32, section: Section) -> Result<u64, BlockError> {
        let index = self.section_index(format_version, section)?;
        Ok(self.table_of_contents[index])
    }

    /// Size of `section` in bytes. The last section extends to the end of the service.
    pub fn section_size(&self, format_version: u32, section: Section) -> Result<u64, BlockError> {
        let index = self.section_index(format_version, section)?;
        let start = self.table_of_contents[index];
        let end = match self.table_of_contents.get(index + 1) {
            Some(next) => *next,
            None => self.offset().unwrap_or(0).saturating_add(self.size),
        };
        Ok(end.saturating_sub(start))
    }

    /// Rough memory footprint of merging this service.
    ///
    /// Symbols and the series index are decoded entirely in memory and expand
    /// roughly four times; profile rows are streamed through a read buffer.
    pub fn estimated_merge_memory(&self, format_version: u32) -> Result<u64, BlockError> {
        let symbols = self.section_size(format_version, Section::Symbols)?;
        let tsdb = self.section_size(format_version, Section::Tsdb)?;
        let profiles = self.section_size(format_version, Section::Profiles)?;
        Ok(symbols
            .saturating_mul(4)
            .saturating_add(tsdb.saturating_mul(4))
            .saturating_add(profiles))
    }
}
