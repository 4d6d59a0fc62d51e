// SPDX-License-Identifier: GPL-3.0-or-later
#![deny(clippy::all)]
#![deny(clippy::pedantic)]

use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use log::{debug, error, info};
use std::{
    fs::File,
    io::{self, BufRead, BufReader},
};
use tpm2_call::ResponseCode;
use tpm2_core::crypto::sim::{SimCrypto, SimRng};
use tpm2_core::crypto::HashAlg;
use tpm2_core::da::LockoutContext;
use tpm2_core::nv::NvStore;
use tpm2_core::pipeline::check_pw_auth;
use tpm2_core::Tpm;

/// Errors local to reading and parsing a trace, distinct from
/// [`tpm2_core::TpmError`] which carries a response code.
#[derive(Debug, strum_macros::Display, PartialEq)]
pub enum CliError {
    /// A trace line did not parse as a known directive.
    InvalidLine,
    /// A trace line's hex argument did not decode.
    InvalidHex,
    /// The replay file could not be opened.
    InvalidRead,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Decode a response code
    Rc {
        /// Response code
        #[arg(value_parser = maybe_hex::<u32>)]
        rc: u32,
    },
    /// Drive the authorization core over a textual trace
    Run {
        /// Read the trace from this file instead of stdin
        #[arg(long)]
        replay: Option<String>,
    },
}

fn decode_hex(s: &str) -> Result<Vec<u8>, CliError> {
    if s.len() % 2 != 0 {
        return Err(CliError::InvalidHex);
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| CliError::InvalidHex))
        .collect()
}

/// Runs one trace directive against `tpm`, printing its effect. Unknown
/// directives and malformed arguments are reported and otherwise ignored so a
/// long trace keeps going after a typo, matching the forgiving style the
/// `Rc` subcommand already has with bad input.
fn run_directive(tpm: &mut Tpm, line: &str) -> Result<(), CliError> {
    let mut words = line.split_whitespace();
    let directive = match words.next() {
        Some(d) => d,
        None => return Ok(()),
    };

    match directive {
        "poweron" => {
            tpm.lifecycle.power_on_reset(&mut tpm.platform);
            println!("power-on reset");
        }
        "startup" => {
            tpm.lifecycle.register_startup();
            println!("startup registered");
        }
        "define-owner-auth" => {
            let hex = words.next().ok_or(CliError::InvalidLine)?;
            tpm.persistent.owner_auth = decode_hex(hex)?;
            println!("owner auth value set ({} bytes)", tpm.persistent.owner_auth.len());
        }
        "pw" => {
            let hex = words.next().ok_or(CliError::InvalidLine)?;
            let input_auth = decode_hex(hex)?;
            let ok = check_pw_auth(&input_auth, &tpm.persistent.owner_auth);
            if ok {
                println!("pw auth ok");
            } else {
                let ctx = LockoutContext {
                    is_password_session: true,
                    is_lockout_bound: false,
                    is_da_bound: false,
                    includes_auth: true,
                };
                let nv_available = tpm.nv_usable_for_authorization();
                let err = tpm.da.increment_lockout(false, false, ctx, nv_available);
                tpm.flush_pending_da_state();
                println!("pw auth failed: {err}");
            }
        }
        "audit-set" => {
            let cc = parse_hex_u32(words.next())?;
            tpm.audit.set(cc);
            println!("audit-set {cc:#010x} -> {}", tpm.audit.is_required(cc));
        }
        "audit-clear" => {
            let cc = parse_hex_u32(words.next())?;
            tpm.audit.clear(cc);
            println!("audit-clear {cc:#010x} -> {}", tpm.audit.is_required(cc));
        }
        "audit-status" => {
            let cc = parse_hex_u32(words.next())?;
            println!("audit-status {cc:#010x} -> {}", tpm.audit.is_required(cc));
        }
        "audit-digest" => {
            let digest = tpm.audit.digest(tpm.crypto.as_ref());
            println!("audit-digest {}", hex_string(&digest));
        }
        "lockout-status" => {
            let locked = tpm.da.check_locked_out(false, tpm.nv.is_available(), tpm.persistent.orderly).is_err();
            println!("lockout-status locked={locked} failed_tries={}", tpm.da.failed_tries);
        }
        _ => return Err(CliError::InvalidLine),
    }
    Ok(())
}

fn parse_hex_u32(word: Option<&str>) -> Result<u32, CliError> {
    let word = word.ok_or(CliError::InvalidLine)?;
    let word = word.strip_prefix("0x").unwrap_or(word);
    u32::from_str_radix(word, 16).map_err(|_| CliError::InvalidHex)
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn run_trace(replay: Option<&str>) -> Result<(), CliError> {
    let mut tpm = Tpm::new(3, HashAlg::Sha256, Box::new(SimCrypto), Box::new(SimRng::default()));
    debug!("simulated TPM constructed");

    let reader: Box<dyn BufRead> = match replay {
        Some(path) => Box::new(BufReader::new(File::open(path).map_err(|_| CliError::InvalidRead)?)),
        None => Box::new(BufReader::new(io::stdin())),
    };

    for line in reader.lines() {
        let line = line.map_err(|_| CliError::InvalidRead)?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Err(err) = run_directive(&mut tpm, line) {
            error!("{err}: {line}");
        }
    }
    info!("trace complete");
    Ok(())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    match &cli.command {
        Commands::Rc { rc } => {
            println!("{} {rc:#010x}", ResponseCode::from(*rc));
        }
        Commands::Run { replay } => {
            run_trace(replay.as_deref()).unwrap_or_else(|err| {
                error!("{err}");
                std::process::exit(1);
            });
        }
    }
}
