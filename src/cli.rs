use core::convert::TryFrom;

use anyhow::Result;
use clap::{crate_authors, crate_version, App, AppSettings, Arg, ArgMatches, SubCommand};

use crate::config::{Backend, Config, DEFAULT_STATE_FILE};
use crate::nv::NvIndex;
use crate::policy::{HashAlgorithm, PcrSelection};
use crate::secret::Password;
use crate::totp::TotpCode;
use crate::Error;

const ABOUT: &str = "
Time-based one-time passwords whose secret is sealed to the platform state.

Show the code next to the one of an authenticator app enrolled with `generate`
to check that the machine booted into a known state.
";

pub fn app() -> clap::App<'static, 'static> {
    App::new("tpm-totp")
        .author(crate_authors!())
        .version(crate_version!())
        .about(ABOUT)
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("tcti")
                .long("tcti")
                .value_name("TCTI")
                .help("TPM connection, e.g. device:/dev/tpmrm0; defaults to $TPM2TOOLS_TCTI")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("simulator")
                .long("simulator")
                .help("use the software module instead of a TPM")
                .global(true),
        )
        .arg(
            Arg::with_name("STATE-FILE")
                .short("s")
                .long("state-file")
                .value_name("FILE")
                .help("file containing the persistent state of the software module")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("nvindex")
                .short("N")
                .long("nvindex")
                .value_name("INDEX")
                .help("NV index of the sealed key, e.g. 0x018094AF")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("password")
                .short("P")
                .long("password")
                .value_name("PASSWORD")
                .help("recovery password; adds a password branch to new keys")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("pcrs")
                .short("p")
                .long("pcrs")
                .value_name("LIST")
                .help("comma-separated PCRs to seal to, default 0,2,4,6")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("bank")
                .short("b")
                .long("bank")
                .value_name("BANK")
                .help("PCR bank to seal to, sha1 or sha256")
                .possible_values(&["sha1", "sha256"])
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("print debug messages")
                .global(true),
        )
        .subcommand(SubCommand::with_name("generate").about(
            "generate a new TOTP secret, seal it and print it for enrollment",
        ))
        .subcommand(
            SubCommand::with_name("calculate")
                .about("unseal the secret with the current platform state and print the code")
                .arg(
                    Arg::with_name("time")
                        .short("t")
                        .long("time")
                        .help("also print the time the code was computed for"),
                )
                .arg(
                    Arg::with_name("TIMESTAMP")
                        .short("T")
                        .long("timestamp")
                        .value_name("TIMESTAMP")
                        .help("compute the code for this time, as seconds since the UNIX epoch")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("reseal")
                .about("seal the secret to the current platform state, needs the password"),
        )
        .subcommand(
            SubCommand::with_name("recover")
                .about("unseal the secret with the password and print it for enrollment"),
        )
        .subcommand(
            SubCommand::with_name("clean").about("delete the sealed secret from NV storage"),
        )
}

/// The public API of this command line
#[derive(Clone, Debug, PartialEq)]
#[allow(missing_docs)]
pub enum Command {
    Generate,
    /// `None` means the current time.
    Calculate { timestamp: Option<u64> },
    Reseal,
    Recover,
    Clean,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Invocation {
    pub config: Config,
    pub command: Command,
}

/// Values of global options land in the subcommand's matches; look there first.
fn value_of<'a>(
    args: &'a ArgMatches<'static>,
    command: &'a ArgMatches<'static>,
    name: &str,
) -> Option<&'a str> {
    command.value_of(name).or_else(|| args.value_of(name))
}

fn is_present(args: &ArgMatches<'static>, command: &ArgMatches<'static>, name: &str) -> bool {
    command.is_present(name) || args.is_present(name)
}

fn parse_pcrs(bank: HashAlgorithm, list: &str) -> Result<PcrSelection, Error> {
    let indices = list
        .split(',')
        .map(|index| index.trim().parse::<u8>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| Error::IllFormedPolicy("PCRs must be a comma-separated list of numbers"))?;
    PcrSelection::new(bank, indices)
}

fn backend(args: &ArgMatches<'static>, command: &ArgMatches<'static>) -> Result<Backend> {
    let tcti = value_of(args, command, "tcti");
    let state_file = value_of(args, command, "STATE-FILE");

    if is_present(args, command, "simulator") {
        if tcti.is_some() {
            return Err(anyhow::anyhow!("--tcti and --simulator exclude each other"));
        }
        let state_file = state_file.unwrap_or(DEFAULT_STATE_FILE);
        return Ok(Backend::Simulator { state_file: state_file.into() });
    }
    if state_file.is_some() {
        return Err(anyhow::anyhow!("--state-file only applies with --simulator"));
    }
    Ok(Backend::Tpm { tcti: tcti.map(String::from) })
}

impl TryFrom<&'_ clap::ArgMatches<'static>> for Invocation {
    type Error = anyhow::Error;

    fn try_from(args: &clap::ArgMatches<'static>) -> Result<Self> {
        let (name, command) = match args.subcommand() {
            (name, Some(command)) => (name, command),
            _ => return Err(anyhow::anyhow!("no command given")),
        };

        let mut config = Config::default();
        if let Some(index) = value_of(args, command, "nvindex") {
            config.nv_index = index.parse::<NvIndex>()?;
        }
        let bank = match value_of(args, command, "bank") {
            Some(bank) => bank.parse()?,
            None => config.pcrs.bank(),
        };
        config.pcrs = match value_of(args, command, "pcrs") {
            Some(list) => parse_pcrs(bank, list)?,
            None => PcrSelection::from_mask(bank, config.pcrs.mask()).map_err(Error::from)?,
        };
        config.password = value_of(args, command, "password").map(Password::from);
        config.verbose = is_present(args, command, "verbose");
        config.backend = backend(args, command)?;

        let command = match name {
            "generate" => Command::Generate,
            "calculate" => {
                config.show_time = command.is_present("time");
                let timestamp = match command.value_of("TIMESTAMP") {
                    Some(s) => Some(s.parse()?),
                    None => None,
                };
                Command::Calculate { timestamp }
            }
            "reseal" | "recover" => {
                if config.password.is_none() {
                    return Err(Error::MissingPassword.into());
                }
                if name == "reseal" {
                    Command::Reseal
                } else {
                    Command::Recover
                }
            }
            "clean" => Command::Clean,
            other => return Err(anyhow::anyhow!("unexpected command {}", other)),
        };

        Ok(Invocation { config, command })
    }
}

/// Exit status for a failed invocation.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<Error>() {
        Some(Error::ModuleCommunication(_)) => 2,
        Some(Error::PolicyNotSatisfied) => 3,
        Some(Error::BlobDecode(_)) => 4,
        Some(Error::NvNotFound(_)) => 5,
        Some(Error::NvAlreadyExists(_)) => 6,
        Some(Error::IllFormedPolicy(_))
        | Some(Error::MissingPassword)
        | Some(Error::InvalidNvIndex(_))
        | Some(Error::UnparsableNvIndex(_)) => 7,
        _ => 1,
    }
}

/// The code, prefixed with the local time it was computed for if asked to.
pub fn render_code(code: &TotpCode, show_time: bool) -> String {
    use chrono::TimeZone;

    if !show_time {
        return code.otp.to_string();
    }
    match chrono::Local.timestamp_opt(code.timestamp as i64, 0).single() {
        Some(time) => format!("{}: {}", time.format("%Y-%m-%d %H:%M:%S"), code.otp),
        None => format!("{}: {}", code.timestamp, code.otp),
    }
}
