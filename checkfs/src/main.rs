//! The `checkfs` tool checks and repairs a filesystem's metadata offline.

use std::env;
use std::path::PathBuf;
use std::process::exit;

use checkfs::device::FileDevice;
use checkfs::engine::{self, RunOptions};
use checkfs::problem::Policy;

/// Structure storing command line arguments, in the style of `mkfs`'s and
/// `fdisk`'s own `Args` structs: hand-rolled, no argument-parsing crate.
#[derive(Default)]
struct Args {
	/// The name of the current program used in command line.
	prog: String,

	/// `-p` / `-a`: preen.
	preen: bool,
	/// `-y` / `-n`: blanket answer, if forced.
	assume: Option<bool>,
	/// `-f`: force check even on clean filesystem.
	force: bool,
	/// `-b`: alternate superblock block number.
	alt_superblock: Option<u64>,
	/// `-B`: alternate block size.
	alt_blocksize: Option<u32>,
	/// `-v`: verbose statistics.
	verbose: bool,
	/// `-t`: timing / resource tracking.
	timing: bool,
	/// `-F`: flush device buffers before checking.
	flush_first: bool,
	/// `-V`: print version and exit.
	version: bool,

	/// If true, print command line help.
	help: bool,

	/// The path to the device file to check.
	device_path: Option<PathBuf>,
}

fn print_usage(prog: &str) {
	eprintln!("Usage: {prog} [-p|-a] [-y|-n] [-fvtFV] [-b block] [-B size] device");
	eprintln!();
	eprintln!("Options:");
	eprintln!(" -p, -a:\tpreen: fix safe problems automatically, halt on anything else");
	eprintln!(" -y:\t\tassume yes to all prompts");
	eprintln!(" -n:\t\tassume no to all prompts (implies read-only)");
	eprintln!(" -f:\t\tforce a check even if the filesystem looks clean");
	eprintln!(" -b block:\tuse an alternate superblock location");
	eprintln!(" -B size:\tassume this block size instead of probing it");
	eprintln!(" -v:\t\tverbose statistics");
	eprintln!(" -t:\t\ttime and report resource usage");
	eprintln!(" -F:\t\tflush device buffers before checking");
	eprintln!(" -V:\t\tprint version and exit");
}

fn parse_args() -> Args {
	let mut args: Args = Default::default();
	let mut iter = env::args();
	args.prog = iter.next().unwrap_or_else(|| "checkfs".to_owned());

	while let Some(arg) = iter.next() {
		match arg.as_str() {
			"-h" | "--help" => args.help = true,
			"-p" | "-a" => args.preen = true,
			"-y" => args.assume = Some(true),
			"-n" => args.assume = Some(false),
			"-f" => args.force = true,
			"-v" => args.verbose = true,
			"-t" => args.timing = true,
			"-F" => args.flush_first = true,
			"-V" => args.version = true,
			"-b" => {
				let value = iter.next().unwrap_or_else(|| {
					eprintln!("{}: -b requires a block number", args.prog);
					exit(16);
				});
				args.alt_superblock = value.parse().ok();
			}
			"-B" => {
				let value = iter.next().unwrap_or_else(|| {
					eprintln!("{}: -B requires a block size", args.prog);
					exit(16);
				});
				args.alt_blocksize = value.parse().ok();
			}
			_ => {
				args.device_path = Some(PathBuf::from(arg));
			}
		}
	}

	args
}

fn main() {
	env_logger::init();
	let args = parse_args();

	if args.version {
		println!("checkfs {}", env!("CARGO_PKG_VERSION"));
		exit(0);
	}
	if args.help {
		print_usage(&args.prog);
		exit(0);
	}

	let device_path = args.device_path.unwrap_or_else(|| {
		eprintln!("{}: specify a device to check", args.prog);
		print_usage(&args.prog);
		exit(16);
	});

	let policy = if args.preen {
		Policy::Preen
	} else {
		Policy::Interactive { assume: args.assume }
	};

	let block_size = args.alt_blocksize.unwrap_or(1024);
	let mut dev = FileDevice::open(&device_path, block_size).unwrap_or_else(|e| {
		eprintln!("{}: {}: {}", args.prog, device_path.display(), e);
		exit(8);
	});

	if args.flush_first {
		if let Err(e) = dev.flush() {
			eprintln!("{}: {}: {}", args.prog, device_path.display(), e);
			exit(8);
		}
	}

	let start = args.timing.then(std::time::Instant::now);

	let opts = RunOptions {
		policy,
		verbose: args.verbose,
		force: args.force,
	};
	let report = engine::run(&mut dev, None, opts).unwrap_or_else(|e| {
		eprintln!("{}: {}: {}", args.prog, device_path.display(), e);
		exit(8);
	});

	if let Some(start) = start {
		eprintln!("{}: {:?} elapsed", args.prog, start.elapsed());
	}
	if args.verbose {
		println!(
			"{}: {} inodes used, {} blocks used, {} problem(s) fixed",
			args.prog, report.stats.inodes_used, report.stats.blocks_used, report.stats.problems_fixed
		);
	}

	exit(report.exit_code.bits() as i32);
}
