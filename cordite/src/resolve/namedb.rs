//! The member-renaming database.
//!
//! A zipped container with two entries, `routine_names` and `field_names`,
//! each mapping a full JTS name to a replacement short name. The original
//! JTS is preserved for all lookups; only user-facing output is renamed.
//! A missing database file is created empty on first open.

use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;

use fxhash::FxHashMap;
use tracing::debug;
use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::errors::LoadError;

#[derive(Debug)]
pub struct NameDb {
	path: PathBuf,
	routine_names: FxHashMap<String, String>,
	field_names: FxHashMap<String, String>,
}

fn db_err(reason: impl ToString) -> LoadError {
	LoadError::NameDb(reason.to_string())
}

impl NameDb {
	pub fn open(path: PathBuf) -> Result<Self, LoadError> {
		if !path.is_file() {
			let db = Self {
				path,
				routine_names: FxHashMap::default(),
				field_names: FxHashMap::default(),
			};
			db.save()?;
			return Ok(db);
		}

		let file = File::open(&path).map_err(db_err)?;
		let mut archive = ZipArchive::new(file)
			.map_err(|e| db_err(format!("does not appear to be a zipped name database: {e}")))?;
		let mut read_map = |name: &str| -> Result<FxHashMap<String, String>, LoadError> {
			let mut entry = archive.by_name(name).map_err(db_err)?;
			let mut bytes = Vec::new();
			entry.read_to_end(&mut bytes).map_err(db_err)?;
			serde_json::from_slice(&bytes).map_err(db_err)
		};
		let routine_names = read_map("routine_names")?;
		let field_names = read_map("field_names")?;
		debug!(
			"opened name database with {} routine and {} field entries",
			routine_names.len(),
			field_names.len()
		);
		Ok(Self { path, routine_names, field_names })
	}

	pub fn save(&self) -> Result<(), LoadError> {
		let file = File::create(&self.path).map_err(db_err)?;
		let mut writer = ZipWriter::new(file);
		let options = FileOptions::default();
		writer.start_file("routine_names", options).map_err(db_err)?;
		writer
			.write_all(&serde_json::to_vec(&self.routine_names).map_err(db_err)?)
			.map_err(db_err)?;
		writer.start_file("field_names", options).map_err(db_err)?;
		writer
			.write_all(&serde_json::to_vec(&self.field_names).map_err(db_err)?)
			.map_err(db_err)?;
		writer.finish().map_err(db_err)?;
		Ok(())
	}

	pub fn routine_name(&self, jts: &str) -> Option<&str> {
		self.routine_names.get(jts).map(String::as_str)
	}

	pub fn field_name(&self, path: &str) -> Option<&str> {
		self.field_names.get(path).map(String::as_str)
	}

	pub fn routine_names(&self) -> &FxHashMap<String, String> {
		&self.routine_names
	}

	pub fn field_names(&self) -> &FxHashMap<String, String> {
		&self.field_names
	}

	/// Find the stored key whose current rendering matches `displayed`;
	/// renames are keyed by the original JTS, so a second rename of the
	/// same member must find the first key again.
	pub(crate) fn routine_key_for(&self, displayed: &str) -> String {
		for (key, mapped) in &self.routine_names {
			let Some((front, params)) = key.split_once('(') else { continue };
			let Some((class, _)) = front.rsplit_once('/') else { continue };
			if displayed == format!("{class}/{mapped}({params}") {
				return key.clone();
			}
		}
		displayed.to_string()
	}

	pub(crate) fn field_key_for(&self, displayed: &str) -> String {
		for (key, mapped) in &self.field_names {
			let Some((class, _)) = key.rsplit_once('/') else { continue };
			if displayed == format!("{class}/{mapped}") {
				return key.clone();
			}
		}
		displayed.to_string()
	}

	pub(crate) fn insert_routine(&mut self, key: String, value: String) {
		self.routine_names.insert(key, value);
	}

	pub(crate) fn insert_field(&mut self, key: String, value: String) {
		self.field_names.insert(key, value);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_db_created_and_round_trips() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("names.db");
		{
			let mut db = NameDb::open(path.clone()).unwrap();
			db.insert_routine("pkg/Cls/a(I)V".into(), "start".into());
			db.insert_field("pkg/Cls/f_001".into(), "counter".into());
			db.save().unwrap();
		}
		let db = NameDb::open(path).unwrap();
		assert_eq!(db.routine_name("pkg/Cls/a(I)V"), Some("start"));
		assert_eq!(db.field_name("pkg/Cls/f_001"), Some("counter"));
		assert_eq!(db.routine_name("pkg/Cls/b()V"), None);
	}

	#[test]
	fn rename_keys_survive_display_mapping() {
		let dir = tempfile::tempdir().unwrap();
		let mut db = NameDb::open(dir.path().join("names.db")).unwrap();
		db.insert_routine("pkg/Cls/a(I)V".into(), "start".into());
		// A second rename sees the displayed name and must find the key.
		assert_eq!(db.routine_key_for("pkg/Cls/start(I)V"), "pkg/Cls/a(I)V");
		assert_eq!(db.routine_key_for("pkg/Cls/other(I)V"), "pkg/Cls/other(I)V");
	}
}
