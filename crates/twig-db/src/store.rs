use std::path::Path;

use crate::conversations::Conversations;
use crate::database::Database;
use crate::error::Result;

pub struct Store {
    db: Database,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            db: Database::open(path.as_ref())?,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            db: Database::open_in_memory()?,
        })
    }

    pub fn conversations(&mut self) -> Conversations<'_> {
        Conversations { db: &mut self.db }
    }
}
