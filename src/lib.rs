pub mod cidr;
pub mod dns;
pub mod obfuscate;
pub mod smb;
pub mod tracer;
pub mod workers;
