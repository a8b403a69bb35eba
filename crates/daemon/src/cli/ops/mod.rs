pub mod cat;
pub mod health;
pub mod init;
pub mod ls;
pub mod mkdir;
pub mod put;
pub mod rm;
pub mod serve;
pub mod stat;
pub mod stats;
pub mod version;

crate::command_enum! {
    (Init, init::Init),
    (Serve, serve::Serve),
    (Health, health::Health),
    (Ls, ls::Ls),
    (Cat, cat::Cat),
    (Put, put::Put),
    (Mkdir, mkdir::Mkdir),
    (Rm, rm::Rm),
    (Stat, stat::Stat),
    (Stats, stats::Stats),
    (Version, version::Version),
}
