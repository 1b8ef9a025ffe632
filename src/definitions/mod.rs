pub mod certificate;
pub mod command;
pub mod keys;
pub mod packet;

pub use certificate::{
    Certificate, CertificateKind, Permissions, UserBinding, VehicleBinding, CERTIFICATE_VERSION,
};
pub use command::{Command, CommandKind, CommandResult, VehicleStatus};
pub use keys::{Curve, EccKeyPair, PublicKey};
pub use packet::{
    ClientHello, CommandPacket, Frame, HandshakeRejected, ResponsePacket, ServerHello,
};
