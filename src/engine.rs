// physdbtool/src/engine.rs
//! Storage engine families and the on-disk files that belong to them.

use std::fmt;
use std::path::Path;

use crate::utils::quote_identifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageEngine {
    /// Transportable tablespaces: discard, replace the files, import.
    InnoDb,
    /// No tablespace transport: files are replaced under `LOCK TABLES ... WRITE`.
    MyIsam,
}

impl StorageEngine {
    /// Maps the `engine` column of `information_schema.tables`.
    /// Anything other than InnoDB or MyISAM is not handled by the physical protocol.
    pub fn from_catalog(engine: &str) -> Option<Self> {
        match engine {
            "InnoDB" => Some(StorageEngine::InnoDb),
            "MyISAM" => Some(StorageEngine::MyIsam),
            _ => None,
        }
    }

    /// Files that must exist for a table after `FLUSH TABLES ... FOR EXPORT`.
    ///
    /// InnoDB needs the `.cfg` written by the export flush to import the
    /// tablespace, and the `.frm` so the table can be reconstructed if the
    /// import ever fails.
    pub fn required_export_files(self) -> &'static [FileKind] {
        match self {
            StorageEngine::InnoDb => &[FileKind::Metadata, FileKind::Structure],
            StorageEngine::MyIsam => &[FileKind::MyIsamData, FileKind::MyIsamIndex],
        }
    }

    /// Files copied from the backup into the target directory on restore.
    pub fn transported_files(self) -> &'static [FileKind] {
        match self {
            StorageEngine::InnoDb => &[FileKind::TablespaceData, FileKind::Metadata],
            StorageEngine::MyIsam => &[FileKind::MyIsamData, FileKind::MyIsamIndex],
        }
    }

    /// Bulk files worth pre-fetching from a lazily loaded volume.
    pub fn warmup_files(self) -> &'static [FileKind] {
        match self {
            StorageEngine::InnoDb => &[FileKind::TablespaceData],
            StorageEngine::MyIsam => &[FileKind::MyIsamData, FileKind::MyIsamIndex],
        }
    }

    /// Statement used to rebuild a table after its files were swapped in.
    pub fn repair_statement(self, table: &str) -> String {
        match self {
            // FULLTEXT indexes do not survive tablespace transport; OPTIMIZE rebuilds them
            StorageEngine::InnoDb => format!("OPTIMIZE TABLE {};", quote_identifier(table)),
            StorageEngine::MyIsam => format!("REPAIR TABLE {} USE_FRM;", quote_identifier(table)),
        }
    }
}

impl fmt::Display for StorageEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageEngine::InnoDb => write!(f, "InnoDB"),
            StorageEngine::MyIsam => write!(f, "MyISAM"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// `.frm` table definition
    Structure,
    /// `.cfg` export metadata
    Metadata,
    /// `.ibd`
    TablespaceData,
    /// `.MYD`
    MyIsamData,
    /// `.MYI`
    MyIsamIndex,
}

impl FileKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "frm" => Some(FileKind::Structure),
            "cfg" => Some(FileKind::Metadata),
            "ibd" => Some(FileKind::TablespaceData),
            "myd" => Some(FileKind::MyIsamData),
            "myi" => Some(FileKind::MyIsamIndex),
            _ => None,
        }
    }

    /// Extension as the server writes it.
    pub fn extension(self) -> &'static str {
        match self {
            FileKind::Structure => "frm",
            FileKind::Metadata => "cfg",
            FileKind::TablespaceData => "ibd",
            FileKind::MyIsamData => "MYD",
            FileKind::MyIsamIndex => "MYI",
        }
    }

    pub fn file_name(self, table: &str) -> String {
        format!("{}.{}", table, self.extension())
    }

    /// Small structural files get a content checksum. Bulk data files are
    /// written with O_DIRECT on modern servers, so their size is the only
    /// meaningful signal that the sync happened.
    pub fn is_checksummed(self) -> bool {
        matches!(
            self,
            FileKind::Structure | FileKind::Metadata | FileKind::MyIsamIndex
        )
    }
}
