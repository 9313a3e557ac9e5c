//! Archive index structures
//!
//! An archive's index part (`.000.tiger`) starts with an [`ArchiveHeader`]
//! followed by a platform tag and a pre-allocated table of fixed-size file
//! records. Record layout depends on the game, see [`FileRecordLayout`].
//!
//! [`FileRecordLayout`]: crate::game::FileRecordLayout

mod header;
mod record;

pub use header::{ArchiveHeader, NUM_FILES_OFFSET, NUM_PARTS_OFFSET};
pub use record::{read_file_record, write_file_record};
