//! Fixtures shared by unit tests.
use strum::IntoEnumIterator;
use time::{macros::datetime, Duration, OffsetDateTime};

use crate::authority::{issuance::CertificateBuilder, TrustAnchorRegistry};
use crate::definitions::{
    Certificate, CommandKind, Curve, EccKeyPair, Permissions, UserBinding, VehicleBinding,
};

pub const NOW: OffsetDateTime = datetime!(2024-06-01 12:00 UTC);
pub const VIN: &str = "VIN-TEST-0001";

/// Root, vehicle and user certificates with their keys.
///
/// The user certificate is issued by the vehicle certificate, which is
/// issued by the root.
pub struct Pki {
    pub root_key: EccKeyPair,
    pub root: Certificate,
    pub vehicle_key: EccKeyPair,
    pub vehicle: Certificate,
    pub user_key: EccKeyPair,
    pub user: Certificate,
    pub anchors: TrustAnchorRegistry,
}

impl Pki {
    pub fn new(permissions: Permissions) -> Self {
        Self::on_curve(Curve::Secp256r1, permissions)
    }

    pub fn on_curve(curve: Curve, permissions: Permissions) -> Self {
        let root_key = EccKeyPair::generate(curve);
        let root = CertificateBuilder::root("Test Root CA", root_key.public_key())
            .validity(NOW - Duration::days(365), NOW + Duration::days(5 * 365))
            .self_sign(&root_key)
            .unwrap();

        let vehicle_key = EccKeyPair::generate(curve);
        let vehicle = CertificateBuilder::vehicle(
            "Test Vehicle",
            vehicle_key.public_key(),
            VehicleBinding {
                vehicle_id: VIN.into(),
                device_id: "obu-01".into(),
                capabilities: CommandKind::iter().collect(),
            },
        )
        .validity(NOW - Duration::days(1), NOW + Duration::days(365))
        .issue(&root, &root_key)
        .unwrap();

        let user_key = EccKeyPair::generate(curve);
        let user = CertificateBuilder::user(
            "alice",
            user_key.public_key(),
            UserBinding {
                user_id: "alice".into(),
                vehicle_id: VIN.into(),
                permissions,
                key_id: Some("key-1".into()),
                additional_vehicles: vec![],
            },
        )
        .validity(NOW - Duration::days(1), NOW + Duration::days(30))
        .issue(&vehicle, &vehicle_key)
        .unwrap();

        let anchors = TrustAnchorRegistry::from_roots(vec![root.clone()]).unwrap();

        Self {
            root_key,
            root,
            vehicle_key,
            vehicle,
            user_key,
            user,
            anchors,
        }
    }

    pub fn intermediates(&self) -> Vec<Certificate> {
        vec![self.vehicle.clone()]
    }
}

pub fn all_permissions() -> Permissions {
    Permissions {
        unlock: true,
        lock: true,
        start_engine: true,
    }
}
