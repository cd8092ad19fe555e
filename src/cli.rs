use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "enkrypt-backups-rs",
    version,
    about = "Signature-authenticated backup storage API"
)]
pub struct Args {
    /// Overrides API_HTTP_HOST.
    #[arg(long)]
    pub host: Option<String>,
    /// Overrides API_HTTP_PORT.
    #[arg(long)]
    pub port: Option<u16>,
    #[arg(long, default_value_t = false)]
    pub print_openapi: bool,
}
