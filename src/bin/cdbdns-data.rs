//! cdbdns-data
//!
//! Compiles zone data into `data.cdb`. The new database is written to
//! `data.tmp` and renamed into place, so a running server never sees a
//! half-written file.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Cursor};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::UNIX_EPOCH;

use chrono::Utc;
use clap::Parser;
use log::{error, info};

use cdbdns::cdb::{CdbBuilder, CdbFile, CdbSink};
use cdbdns::errors::DnsError;
use cdbdns::zonefile::{ZoneCompiler, DEFAULT_SEPARATOR};

/// Exit status when some lines were rejected.
const EXIT_BAD_LINES: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "cdbdns-data", version, about = "Compile zone data into data.cdb")]
struct Args {
    /// Write data.cdb into DIR instead of the current directory
    #[arg(short = 'd', value_name = "DIR")]
    dir: Option<PathBuf>,

    /// Publish even if some lines were rejected
    #[arg(short = 'f')]
    force: bool,

    /// Check the data without writing anything
    #[arg(short = 'n')]
    dry_run: bool,

    /// Field separator
    #[arg(short = 't', value_name = "FS")]
    separator: Option<String>,

    /// Zone data file; standard input if omitted
    input: Option<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    match run(Args::parse()) {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<ExitCode, DnsError> {
    let separator = match args.separator.as_deref() {
        None => DEFAULT_SEPARATOR,
        Some(fs) if fs.len() == 1 => fs.as_bytes()[0],
        Some(fs) => {
            return Err(DnsError::Config(format!(
                "Field separator must be a single byte: {:?}",
                fs
            )))
        }
    };

    // The input's mtime serves as the default SOA serial.
    let (input, serial): (Box<dyn BufRead>, u32) = match &args.input {
        Some(path) => {
            let file = File::open(path)?;
            let serial = file
                .metadata()?
                .modified()?
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as u32)
                .unwrap_or_else(|_| now());
            (Box::new(BufReader::new(file)), serial)
        }
        None => (Box::new(io::stdin().lock()), now()),
    };

    let dest = args.dir.unwrap_or_default().join("data.cdb");

    if args.dry_run {
        let builder = CdbBuilder::new(Cursor::new(Vec::new()))?;
        let compiler = compile(builder, separator, serial, input)?;
        let (lines, failures) = (compiler.lines(), compiler.failures());
        let builder = compiler.into_sink();
        let entries = builder.entries();
        let bytes = builder.finish()?.into_inner().len();
        println!("Read {} lines with {} errors", lines, failures);
        println!("Wrote {} entries in {} bytes", entries, bytes);
        return Ok(status(failures));
    }

    let file = CdbFile::start(&dest)?;
    let compiler = compile(file, separator, serial, input)?;
    let failures = compiler.failures();
    let file = compiler.into_sink();

    if failures > 0 && !args.force {
        file.discard()?;
        error!("{} bad lines, {} left unchanged", failures, dest.display());
        return Ok(status(failures));
    }

    let entries = file.entries();
    file.finish()?;
    info!(
        "Published {} with {} entries ({} bytes)",
        dest.display(),
        entries,
        fs::metadata(&dest)?.len()
    );
    Ok(status(failures))
}

fn compile<S: CdbSink>(
    sink: S,
    separator: u8,
    serial: u32,
    input: Box<dyn BufRead>,
) -> Result<ZoneCompiler<S>, DnsError> {
    let mut compiler = ZoneCompiler::new(sink, serial).with_separator(separator)?;
    compiler.compile(input)?;
    Ok(compiler)
}

fn status(failures: usize) -> ExitCode {
    if failures > 0 {
        ExitCode::from(EXIT_BAD_LINES)
    } else {
        ExitCode::SUCCESS
    }
}

fn now() -> u32 {
    Utc::now().timestamp() as u32
}
