pub mod dkg;
pub mod mac;
pub mod noise;
pub mod oprf;
pub mod pow;
pub mod sign;

pub use dkg::{DkgDeal, DkgParticipant};
pub use mac::{challenge_mac, mac_verify};
pub use oprf::{evaluate, random_key};
pub use sign::verify_blob;
