use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cordite::resolve::{Loader, LoaderOptions, ModuleId};
use cordite::scan::HeuristicScanner;

mod dump;

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum Format {
	/// Labeled text dump of classes, members, and instructions.
	Text,
	/// Serialize resolved modules into the cache root.
	Cache,
}

/// Static-analysis driver for .cod modules: load, resolve, actualize,
/// disassemble, optionally type-scan, then dump.
#[derive(Debug, Parser)]
#[command(name = "cordite", version)]
struct Args {
	/// Module names or .cod paths to process.
	#[arg(required = true)]
	modules: Vec<String>,

	/// Directories scanned for .cod files.
	#[arg(short = 'L', long = "load-path")]
	load_paths: Vec<PathBuf>,

	/// Serialized-module cache (directory, or read-only zip).
	#[arg(long)]
	cache_root: Option<PathBuf>,

	/// Zipped member-renaming database.
	#[arg(long)]
	name_db: Option<PathBuf>,

	#[arg(long, value_enum, default_value_t = Format::Text)]
	format: Format,

	/// Dump each module into its own section header.
	#[arg(long)]
	individual: bool,

	/// Stop after this many modules have been loaded.
	#[arg(long)]
	max_loaded_modules: Option<usize>,

	/// Run the heuristic instruction scanner before dumping.
	#[arg(long)]
	enable_hiscan: bool,

	/// Also process every direct import of the named modules.
	#[arg(long)]
	application_dump: bool,
}

fn main() -> ExitCode {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env())
		.with_writer(std::io::stderr)
		.init();

	let args = Args::parse();
	match run(args) {
		Ok(()) => ExitCode::SUCCESS,
		Err(err) => {
			error!("fatal: {err}");
			ExitCode::FAILURE
		}
	}
}

fn run(args: Args) -> Result<(), cordite::LoadError> {
	let mut loader = Loader::new(LoaderOptions {
		search_paths: args.load_paths.clone(),
		cache_root: args.cache_root.clone(),
		name_db: args.name_db.clone(),
		auto_resolve: true,
	})?;

	let mut ids: Vec<ModuleId> = Vec::new();
	for name in &args.modules {
		let path = PathBuf::from(name);
		let id = match path.is_file() {
			true => loader.load_file(&path)?,
			false => loader.load_module(name)?,
		};
		ids.push(id);

		if args.application_dump {
			let imports: Vec<String> = loader
				.module(id)
				.imports
				.iter()
				.map(|i| i.name.to_string())
				.collect();
			for import in imports {
				ids.push(loader.load_module(&import)?);
			}
		}

		if let Some(max) = args.max_loaded_modules {
			if loader.loaded_modules().count() >= max {
				info!("reached the loaded-module limit ({max})");
				break;
			}
		}
	}
	ids.dedup();

	for id in &ids {
		loader.actualize_module(*id)?;
		loader.disasm_module(*id)?;
	}

	if args.enable_hiscan {
		let modules: Vec<_> = ids.iter().map(|id| loader.module(*id)).collect();
		let mut scanner = HeuristicScanner::new(&mut loader);
		for module in &modules {
			scanner.scan_module(module);
		}
		scanner.into_stats().summarize();
	}

	match args.format {
		Format::Text => {
			let stdout = std::io::stdout();
			let mut out = stdout.lock();
			for id in &ids {
				dump::dump_module(&mut out, &loader, *id, args.individual)?;
			}
		}
		Format::Cache => {
			for id in &ids {
				loader.save_module_cache(*id)?;
			}
		}
	}
	Ok(())
}
