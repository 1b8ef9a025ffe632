use anyhow::{Context, Result};
use strum::IntoEnumIterator;
use time::{macros::datetime, Duration, OffsetDateTime};

use vehicle_key::authority::issuance::CertificateBuilder;
use vehicle_key::definitions::{
    Certificate, CommandKind, Curve, EccKeyPair, Permissions, UserBinding, VehicleBinding,
};
use vehicle_key::storage::{CertificateBundle, MemoryStore};
use vehicle_key::vehicle::{SimulatedVehicle, VehicleUnit};
use vehicle_key::{Config, DigitalKey, ManualClock, Notice, SessionId, TrustAnchorRegistry};

#[allow(dead_code)]
fn main() {}

pub const NOW: OffsetDateTime = datetime!(2025-03-01 08:30 UTC);
pub const VIN: &str = "WVWZZZ1JZXW000001";

pub type Key = DigitalKey<SimulatedVehicle<ManualClock>, MemoryStore, ManualClock>;

pub struct Pki {
    pub root: Certificate,
    pub root_key: EccKeyPair,
    pub vehicle: Certificate,
    pub vehicle_key: EccKeyPair,
    pub user: Certificate,
    pub user_key: EccKeyPair,
    pub anchors: TrustAnchorRegistry,
}

pub fn all_permissions() -> Permissions {
    Permissions {
        unlock: true,
        lock: true,
        start_engine: true,
    }
}

/// Root -> vehicle -> user, with the user valid for 30 days around [NOW].
pub fn pki(curve: Curve, permissions: Permissions) -> Result<Pki> {
    let root_key = EccKeyPair::generate(curve);
    let root = CertificateBuilder::root("OEM Root CA", root_key.public_key())
        .validity(NOW - Duration::days(365), NOW + Duration::days(3650))
        .self_sign(&root_key)?;

    let vehicle_key = EccKeyPair::generate(curve);
    let vehicle = CertificateBuilder::vehicle(
        "Vehicle OBU",
        vehicle_key.public_key(),
        VehicleBinding {
            vehicle_id: VIN.into(),
            device_id: "obu-7".into(),
            capabilities: CommandKind::iter().collect(),
        },
    )
    .validity(NOW - Duration::days(30), NOW + Duration::days(3000))
    .issue(&root, &root_key)?;

    let user_key = EccKeyPair::generate(curve);
    let user = CertificateBuilder::user(
        "Alice",
        user_key.public_key(),
        UserBinding {
            user_id: "alice".into(),
            vehicle_id: VIN.into(),
            permissions,
            key_id: Some("phone-1".into()),
            additional_vehicles: vec![],
        },
    )
    .validity(NOW - Duration::days(1), NOW + Duration::days(30))
    .issue(&vehicle, &vehicle_key)?;

    let anchors = TrustAnchorRegistry::from_roots(vec![root.clone()])?;
    Ok(Pki {
        root,
        root_key,
        vehicle,
        vehicle_key,
        user,
        user_key,
        anchors,
    })
}

pub struct World {
    pub pki: Pki,
    pub clock: ManualClock,
    pub vehicle: SimulatedVehicle<ManualClock>,
    pub key: Key,
}

/// A provisioned key next to a simulated vehicle that trusts `vehicle_anchors`.
pub fn world_with(pki: Pki, vehicle_anchors: TrustAnchorRegistry) -> Result<World> {
    let clock = ManualClock::new(NOW);
    let config = Config::default();
    let unit = VehicleUnit::new(
        pki.vehicle.clone(),
        EccKeyPair::from_secret_bytes(
            pki.vehicle_key.curve(),
            &pki.vehicle_key.to_secret_bytes(),
        )?,
        vehicle_anchors,
        config.session_duration,
    );
    let vehicle = SimulatedVehicle::new(unit, clock.clone());
    let key = DigitalKey::new(
        vehicle.clone(),
        MemoryStore::new(),
        clock.clone(),
        config,
        pki.anchors.clone(),
    );
    key.credentials().save_key_pair(&pki.user_key)?;
    key.credentials().save_certificates(&CertificateBundle {
        user: pki.user.clone(),
        vehicle: pki.vehicle.clone(),
        chain: vec![],
    })?;
    Ok(World {
        pki,
        clock,
        vehicle,
        key,
    })
}

pub fn world(curve: Curve, permissions: Permissions) -> Result<World> {
    let pki = pki(curve, permissions)?;
    let anchors = pki.anchors.clone();
    world_with(pki, anchors)
}

impl World {
    pub fn connect(&mut self) -> Result<()> {
        self.key.start_scan(Duration::seconds(5))?;
        let device = self
            .key
            .discoveries()
            .into_iter()
            .next()
            .context("simulated vehicle did not advertise")?;
        self.key.connect(&device)?;
        Ok(())
    }

    /// Connect if needed and run a handshake to completion.
    #[allow(dead_code)]
    pub fn session(&mut self) -> Result<SessionId> {
        if !self.key.dispatcher().connection().is_connected() {
            self.connect()?;
        }
        let session_id = self.key.establish_session()?;
        let notices = self.key.poll();
        anyhow::ensure!(
            notices.iter().any(|n| matches!(
                n,
                Notice::SessionEstablished { session_id: id, .. } if *id == session_id
            )),
            "handshake did not complete: {notices:?}"
        );
        Ok(session_id)
    }
}
