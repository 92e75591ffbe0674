use core::convert::TryFrom;

use anyhow::Result;
use log::{debug, info};

use tpm_totp::{
    api::Channel,
    authenticator::Authenticator,
    cli::{self, Command, Invocation},
    config::{Backend, Config},
    enrollment, platform,
    secret::Secret,
    totp, Error,
};

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {:#}", err);
        std::process::exit(cli::exit_code(&err));
    }
}

fn run() -> Result<()> {
    let args = init_app();
    let Invocation { config, command } = Invocation::try_from(&args)?;

    init_logger(config.verbose)?;
    debug!("{:?} with {:?}", command, config);

    match &config.backend {
        Backend::Simulator { state_file } => {
            let platform = platform::init_platform(state_file)?;
            dispatch(Authenticator::new(platform), &config, command)
        }
        #[cfg(feature = "tpm")]
        Backend::Tpm { tcti } => {
            let tpm = tpm_totp::tpm::Tpm::open(tcti.as_deref())?;
            dispatch(Authenticator::new(tpm), &config, command)
        }
        #[cfg(not(feature = "tpm"))]
        Backend::Tpm { .. } => Err(anyhow::anyhow!(
            "built without TPM support; rebuild with `--features tpm` or pass --simulator"
        )),
    }
}

fn dispatch<C: Channel>(mut authenticator: Authenticator<C>, config: &Config, command: Command) -> Result<()> {
    match command {
        Command::Generate => {
            let (secret, _) = authenticator.generate(config.nv_index, &config.seal_policy())?;
            info!("sealed a new secret at NV index {}", config.nv_index);
            show_enrollment(&secret)?;
        }
        Command::Calculate { timestamp } => {
            let timestamp = match timestamp {
                Some(timestamp) => timestamp,
                None => totp::now()?,
            };
            let code = authenticator.calculate(config.nv_index, timestamp)?;
            println!("{}", cli::render_code(&code, config.show_time));
        }
        Command::Reseal => {
            let password = config.password.as_ref().ok_or(Error::MissingPassword)?;
            authenticator.reseal(config.nv_index, password, &config.seal_policy())?;
        }
        Command::Recover => {
            let password = config.password.as_ref().ok_or(Error::MissingPassword)?;
            let secret = authenticator.recover(config.nv_index, password)?;
            show_enrollment(&secret)?;
        }
        Command::Clean => {
            authenticator.clean(config.nv_index)?;
        }
    }

    Ok(())
}

fn show_enrollment(secret: &Secret) -> Result<()> {
    let url = enrollment::url(secret);
    let qr = enrollment::qr(&url).map_err(|err| anyhow::anyhow!("cannot render QR code: {}", err))?;
    println!("{}", qr);
    println!("{}", url);
    Ok(())
}

pub fn init_app() -> clap::ArgMatches<'static> {
    cli::app().get_matches()
}

pub fn init_logger(verbose: bool) -> Result<()> {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    };
    simple_logger::SimpleLogger::new().with_level(level).init()?;
    Ok(())
}
