use std::{fs, path::PathBuf};

use anyhow::{Context, Error};
use clap::Parser;
use clap_stdin::MaybeStdin;
use serde::Serialize;
use strum::IntoEnumIterator;
use time::{format_description::well_known::Rfc3339, Duration, OffsetDateTime};
use tracing_subscriber::EnvFilter;
use vehicle_key::{
    authority::{issuance::CertificateBuilder, validate_chain},
    cbor,
    definitions::{
        Certificate, CommandKind, Curve, EccKeyPair, Frame, Permissions, UserBinding,
        VehicleBinding,
    },
    storage::{CertificateBundle, MemoryStore},
    vehicle::{SimulatedVehicle, VehicleUnit},
    Clock, Config, DigitalKey, ManualClock, Notice, TrustAnchorRegistry,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    action: Action,
}

#[derive(Debug, clap::Subcommand)]
enum Action {
    /// Run a full session against an in-process vehicle and print the notices
    /// as JSON lines.
    Simulate {
        /// Commands to send, in order.
        #[arg(long, value_delimiter = ',', default_value = "unlock,status,lock")]
        commands: Vec<CommandKind>,
        #[arg(long, default_value = "secp256r1")]
        curve: Curve,
        /// Issue the user certificate without the engine permission.
        #[arg(long)]
        no_engine: bool,
    },
    /// Validate a JSON certificate against a JSON array of root certificates.
    Validate {
        /// JSON encoded certificate.
        certificate: MaybeStdin<String>,
        /// Path to a JSON array of trusted root certificates.
        #[arg(long)]
        roots: PathBuf,
        /// Path to a JSON array of intermediate certificates.
        #[arg(long)]
        intermediates: Option<PathBuf>,
        /// RFC 3339 instant to validate at, defaults to now.
        #[arg(long)]
        at: Option<String>,
    },
    /// Decode a base64 encoded wire frame.
    Inspect {
        frame: MaybeStdin<String>,
    },
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match Args::parse().action {
        Action::Simulate {
            commands,
            curve,
            no_engine,
        } => simulate(&commands, curve, no_engine),
        Action::Validate {
            certificate,
            roots,
            intermediates,
            at,
        } => validate(&certificate, roots, intermediates, at),
        Action::Inspect { frame } => inspect(&frame),
    }
}

fn print_json(value: &impl Serialize) -> Result<(), Error> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn print_notices(notices: Vec<Notice>) -> Result<(), Error> {
    for notice in notices {
        print_json(&notice)?;
    }
    Ok(())
}

fn simulate(commands: &[CommandKind], curve: Curve, no_engine: bool) -> Result<(), Error> {
    let clock = ManualClock::new(OffsetDateTime::now_utc());
    let now = clock.now();

    let root_key = EccKeyPair::generate(curve);
    let root = CertificateBuilder::root("Simulated Root CA", root_key.public_key())
        .validity(now - Duration::days(1), now + Duration::days(365))
        .self_sign(&root_key)?;

    let vehicle_key = EccKeyPair::generate(curve);
    let vehicle = CertificateBuilder::vehicle(
        "Simulated Vehicle",
        vehicle_key.public_key(),
        VehicleBinding {
            vehicle_id: "SIM0000000000001".into(),
            device_id: "sim-obu".into(),
            capabilities: CommandKind::iter().collect(),
        },
    )
    .validity(now - Duration::days(1), now + Duration::days(365))
    .issue(&root, &root_key)?;

    let user_key = EccKeyPair::generate(curve);
    let user = CertificateBuilder::user(
        "Simulated User",
        user_key.public_key(),
        UserBinding {
            user_id: "sim-user".into(),
            vehicle_id: "SIM0000000000001".into(),
            permissions: Permissions {
                unlock: true,
                lock: true,
                start_engine: !no_engine,
            },
            key_id: None,
            additional_vehicles: vec![],
        },
    )
    .validity(now - Duration::days(1), now + Duration::days(30))
    .issue(&vehicle, &vehicle_key)?;

    let anchors = TrustAnchorRegistry::from_roots(vec![root])?;
    let config = Config::default();
    let radio = SimulatedVehicle::new(
        VehicleUnit::new(
            vehicle.clone(),
            vehicle_key,
            anchors.clone(),
            config.session_duration,
        ),
        clock.clone(),
    );

    let mut key = DigitalKey::new(radio, MemoryStore::new(), clock.clone(), config, anchors);
    key.credentials().save_key_pair(&user_key)?;
    drop(user_key);
    key.credentials().save_certificates(&CertificateBundle {
        user,
        vehicle,
        chain: vec![],
    })?;

    key.start_scan(Duration::seconds(5))?;
    let device = key
        .discoveries()
        .into_iter()
        .next()
        .context("no vehicle found")?;
    key.connect(&device)?;
    print_json(&key.connection_state())?;

    let session = key.establish_session()?;
    print_notices(key.poll())?;

    for kind in commands {
        clock.advance(Duration::seconds(1));
        match key.send((*kind).into(), session) {
            Ok(_) => print_notices(key.poll())?,
            Err(e) => print_json(&serde_json::json!({
                "notice": "commandRefused",
                "kind": kind,
                "reason": e.to_string(),
            }))?,
        }
    }

    key.disconnect();
    print_notices(key.poll())
}

fn validate(
    certificate: &str,
    roots: PathBuf,
    intermediates: Option<PathBuf>,
    at: Option<String>,
) -> Result<(), Error> {
    let certificate: Certificate =
        serde_json::from_str(certificate).context("could not parse certificate")?;
    let anchors = TrustAnchorRegistry::from_json(
        &fs::read_to_string(&roots).with_context(|| format!("could not read {roots:?}"))?,
    )?;
    let intermediates: Vec<Certificate> = match intermediates {
        Some(path) => serde_json::from_str(
            &fs::read_to_string(&path).with_context(|| format!("could not read {path:?}"))?,
        )
        .context("could not parse intermediates")?,
        None => vec![],
    };
    let at = match at {
        Some(at) => OffsetDateTime::parse(&at, &Rfc3339).context("could not parse --at")?,
        None => OffsetDateTime::now_utc(),
    };

    let outcome = validate_chain(&certificate, &intermediates, &anchors, at);
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

fn inspect(frame: &str) -> Result<(), Error> {
    let bytes = base64::decode(frame.trim()).context("frame is not valid base64")?;
    match Frame::from_bytes(&bytes) {
        Ok(frame) => {
            println!("{}", serde_json::to_string_pretty(&frame)?);
        }
        Err(e) => {
            let value = cbor::to_value(&bytes).context("frame is not valid CBOR")?;
            eprintln!("not a protocol frame: {e}");
            println!("{:#?}", value.0);
        }
    }
    Ok(())
}
