use serde::{Deserialize, Serialize};

use crate::common::types::{Page, PageId, PAGE_SIZE};
use crate::index::btree::error::BTreeError;

/// Tag distinguishing the header page from tree node pages
const HEADER_MAGIC: u32 = 0x42_54_48_44;

const PREFIX_LEN: usize = 8;

/// Contents of page 0: ordered `(index_name, root_page_id)` records, one per
/// index hosted in the file. Trees look their root up here on open and write
/// back on every root change, so roots survive restarts.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct HeaderPage {
    records: Vec<(String, PageId)>,
}

impl HeaderPage {
    /// Decode the header from page 0. A zeroed page (fresh file) reads as an
    /// empty record list.
    pub fn load(page: &Page) -> Result<Self, BTreeError> {
        let magic = u32::from_le_bytes(page.data[0..4].try_into().unwrap());
        if magic == 0 {
            return Ok(Self::default());
        }
        if magic != HEADER_MAGIC {
            return Err(BTreeError::InvalidPageFormat);
        }
        let len = u32::from_le_bytes(page.data[4..8].try_into().unwrap()) as usize;
        if PREFIX_LEN + len > PAGE_SIZE {
            return Err(BTreeError::InvalidPageFormat);
        }

        bincode::deserialize(&page.data[PREFIX_LEN..PREFIX_LEN + len])
            .map_err(|e| BTreeError::DeserializationError(e.to_string()))
    }

    /// Encode the header into page 0
    pub fn save(&self, page: &mut Page) -> Result<(), BTreeError> {
        let payload =
            bincode::serialize(self).map_err(|e| BTreeError::SerializationError(e.to_string()))?;
        if PREFIX_LEN + payload.len() > PAGE_SIZE {
            return Err(BTreeError::NodeTooLarge);
        }

        page.data[0..4].copy_from_slice(&HEADER_MAGIC.to_le_bytes());
        page.data[4..8].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        page.data[PREFIX_LEN..PREFIX_LEN + payload.len()].copy_from_slice(&payload);
        Ok(())
    }

    pub fn get_record(&self, name: &str) -> Option<PageId> {
        self.records
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, root)| *root)
    }

    /// Register a new index; false if the name is already present
    pub fn insert_record(&mut self, name: &str, root_page_id: PageId) -> bool {
        if self.get_record(name).is_some() {
            return false;
        }
        self.records.push((name.to_string(), root_page_id));
        true
    }

    /// Update an existing record; false if the name is unknown
    pub fn update_record(&mut self, name: &str, root_page_id: PageId) -> bool {
        match self.records.iter_mut().find(|(n, _)| n == name) {
            Some(record) => {
                record.1 = root_page_id;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::INVALID_PAGE_ID;

    #[test]
    fn test_fresh_page_reads_empty() {
        let page = Page::new(0);
        let header = HeaderPage::load(&page).unwrap();
        assert_eq!(header.get_record("orders_pk"), None);
    }

    #[test]
    fn test_records_round_trip() {
        let mut header = HeaderPage::default();
        assert!(header.insert_record("orders_pk", 3));
        assert!(header.insert_record("users_pk", INVALID_PAGE_ID));
        assert!(!header.insert_record("orders_pk", 9));

        let mut page = Page::new(0);
        header.save(&mut page).unwrap();

        let mut loaded = HeaderPage::load(&page).unwrap();
        assert_eq!(loaded.get_record("orders_pk"), Some(3));
        assert_eq!(loaded.get_record("users_pk"), Some(INVALID_PAGE_ID));

        assert!(loaded.update_record("orders_pk", 12));
        assert!(!loaded.update_record("missing", 1));
        loaded.save(&mut page).unwrap();
        let reloaded = HeaderPage::load(&page).unwrap();
        assert_eq!(reloaded.get_record("orders_pk"), Some(12));
    }
}
