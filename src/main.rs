#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use dotenv::dotenv;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use omniexec::remote::{
    Backend, InputSource, Invocation, InvocationConfig, Operation, PasswordEncoding,
    RawCredentials, Target, WinrmSettings, remote_exit_status, run,
};

#[derive(Parser)]
#[command(name = "omniexec")]
#[command(version)]
#[command(about = "Run SQL queries or shell commands against MySQL, PostgreSQL, SSH and WinRM hosts")]
struct Cli {
    /// Invocation timeout in seconds [env: OMNIEXEC_TIMEOUT] [default: 60]
    #[arg(short = 't', long, global = true)]
    timeout: Option<u64>,

    /// Echo each query or command before running it [env: OMNIEXEC_VERBOSE]
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a query against a MySQL server
    Mysql(SqlArgs),
    /// Run a query against a PostgreSQL server
    Postgres(SqlArgs),
    /// Run commands on a host over SSH
    Ssh(SshArgs),
    /// Run commands on a Windows host over WinRM
    Winrm(WinrmArgs),
}

/// Port, user and database used when the flags are omitted.
struct SqlDefaults {
    port: u16,
    username: &'static str,
    database: &'static str,
}

const MYSQL_DEFAULTS: SqlDefaults = SqlDefaults {
    port: 3306,
    username: "root",
    database: "mysql",
};

const POSTGRES_DEFAULTS: SqlDefaults = SqlDefaults {
    port: 5432,
    username: "postgres",
    database: "postgres",
};

#[derive(Args)]
struct SqlArgs {
    /// Server host
    #[arg(short = 'H', long, default_value = "localhost")]
    host: String,

    /// Server port [default: 3306 for mysql, 5432 for postgres]
    #[arg(short = 'P', long)]
    port: Option<u16>,

    /// Database user [default: root for mysql, postgres for postgres]
    #[arg(short = 'u', long)]
    username: Option<String>,

    /// Database password
    #[arg(short = 'p', long, default_value = "")]
    password: String,

    /// Database name [default: mysql for mysql, postgres for postgres]
    #[arg(short = 'D', long)]
    db: Option<String>,

    /// Query text; all arguments are joined with spaces
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    query: Vec<String>,
}

#[derive(Args)]
struct SshArgs {
    /// Remote host
    #[arg(short = 'H', long, default_value = "localhost")]
    host: String,

    /// Remote port
    #[arg(short = 'P', long, default_value_t = 22)]
    port: u16,

    /// Remote user
    #[arg(short = 'u', long, default_value = "root")]
    username: String,

    /// Password, tried after the identity file
    #[arg(short = 'p', long, default_value = "")]
    password: String,

    /// Private key file; skipped when it does not exist
    #[arg(short = 'i', long)]
    identity_file: Option<PathBuf>,

    /// Passphrase for the private key file
    #[arg(short = 'I', long)]
    identity_file_password: Option<String>,

    /// Commands to run, one per argument
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    commands: Vec<String>,
}

#[derive(Args)]
struct WinrmArgs {
    /// Remote host
    #[arg(short = 'H', long, default_value = "localhost")]
    host: String,

    /// WinRM port
    #[arg(short = 'P', long, default_value_t = 5985)]
    port: u16,

    /// Remote user, `DOMAIN\user` for domain accounts
    #[arg(short = 'u', long, default_value = "root")]
    username: String,

    /// Password
    #[arg(short = 'p', long, default_value = "")]
    password: String,

    /// Authenticate with NTLM instead of Basic
    #[arg(short = 'N', long)]
    ntlm: bool,

    /// The password is base64 encoded
    #[arg(short = 'e', long)]
    encoded: bool,

    /// Connect over HTTPS
    #[arg(short = 'S', long)]
    https: bool,

    /// Skip TLS certificate verification
    #[arg(short = 'k', long)]
    insecure: bool,

    /// PEM file with an additional trusted CA certificate
    #[arg(short = 'c', long)]
    cacert: Option<PathBuf>,

    /// Connect timeout as a duration such as `10s` or `1m`; `0s` waits forever
    #[arg(long, default_value = "0s")]
    connect_timeout: String,

    /// Commands to run, one per argument
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    commands: Vec<String>,
}

impl Commands {
    fn into_invocation(self, config: InvocationConfig) -> Invocation {
        let (target, credentials, args) = match self {
            Commands::Mysql(args) => {
                sql_parts(args, &MYSQL_DEFAULTS, |database| Backend::MySql { database })
            }
            Commands::Postgres(args) => {
                sql_parts(args, &POSTGRES_DEFAULTS, |database| Backend::Postgres { database })
            }
            Commands::Ssh(args) => (
                Target::new(args.host, args.port, Backend::Ssh),
                RawCredentials {
                    username: args.username,
                    password: Some(args.password),
                    identity_file: args.identity_file,
                    identity_passphrase: args.identity_file_password,
                    ..Default::default()
                },
                args.commands,
            ),
            Commands::Winrm(args) => {
                let settings = WinrmSettings {
                    https: args.https,
                    insecure: args.insecure,
                    ca_cert: args.cacert,
                    connect_timeout: args.connect_timeout,
                };
                (
                    Target::new(args.host, args.port, Backend::Winrm(settings)),
                    RawCredentials {
                        username: args.username,
                        password: Some(args.password),
                        ntlm: args.ntlm,
                        password_encoding: if args.encoded {
                            PasswordEncoding::Base64
                        } else {
                            PasswordEncoding::Plain
                        },
                        ..Default::default()
                    },
                    args.commands,
                )
            }
        };

        let operations = Operation::from_args(target.protocol(), &args);
        Invocation {
            target,
            credentials,
            operations,
            config,
        }
    }
}

fn sql_parts(
    args: SqlArgs,
    defaults: &SqlDefaults,
    backend: impl FnOnce(String) -> Backend,
) -> (Target, RawCredentials, Vec<String>) {
    let database = args.db.unwrap_or_else(|| defaults.database.to_string());
    (
        Target::new(args.host, args.port.unwrap_or(defaults.port), backend(database)),
        RawCredentials {
            username: args
                .username
                .unwrap_or_else(|| defaults.username.to_string()),
            password: Some(args.password),
            ..Default::default()
        },
        args.query,
    )
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = match default_level.parse() {
        Ok(directive) => EnvFilter::from_default_env().add_directive(directive),
        Err(_) => EnvFilter::from_default_env(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();

    let cli = Cli::parse();
    let config = InvocationConfig::resolve(cli.timeout, cli.verbose);
    init_tracing(config.verbose);
    debug!("Invocation config: {:?}", config);

    let invocation = cli.command.into_invocation(config);
    let mut input = InputSource::detect();
    let mut stdout = std::io::stdout().lock();
    let mut stderr = std::io::stderr();

    match run(invocation, &mut input, &mut stdout, &mut stderr).await {
        Ok(code) => ExitCode::from(remote_exit_status(code)),
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}
