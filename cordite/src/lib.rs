//! cordite: a static-analysis toolchain for the proprietary `.cod` module
//! format used by a line of handheld devices.
//!
//! The pipeline is: raw bytes -> [`raw`] container parse -> [`resolve`]
//! cross-module binding and actualization -> [`disasm`] instruction
//! decoding with operand fixup -> [`flow`] basic blocks -> [`scan`]
//! heuristic type recovery. Each phase is idempotent and memoized on the
//! module.
//!
//! ```no_run
//! use cordite::resolve::{Loader, LoaderOptions};
//! use cordite::scan::HeuristicScanner;
//!
//! # fn main() -> Result<(), cordite::errors::LoadError> {
//! let mut loader = Loader::new(LoaderOptions {
//! 	search_paths: vec!["./cods".into()],
//! 	..Default::default()
//! })?;
//! let id = loader.load_module("net_rim_cldc")?;
//! loader.actualize_module(id)?;
//! loader.disasm_module(id)?;
//!
//! let module = loader.module(id);
//! let mut scanner = HeuristicScanner::new(&mut loader);
//! scanner.scan_module(&module);
//! scanner.into_stats().summarize();
//! # Ok(())
//! # }
//! ```

pub mod disasm;
pub mod errors;
pub mod flow;
pub mod ident;
pub mod raw;
pub mod reader;
pub mod resolve;
pub mod scan;
pub mod types;

pub use errors::{DisasmError, LoadError, ParseError, ScanError};
pub use resolve::{Loader, LoaderOptions};
