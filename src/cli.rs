/*!
 * 命令行参数定义
 *
 * 只记录用户在命令行上显式给出的参数，默认值统一由 `ConfigResolver` 提供。
 */

use crate::config::{FlagValues, Value};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "serverservice")]
#[command(about = "Hollow server inventory service", long_about = None, version)]
pub struct Cli {
    /// TOML config file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// starts the hollow server
    Serve(ServeArgs),
}

#[derive(Args, Debug, Default, Clone)]
pub struct ServeArgs {
    /// address to listen on
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<String>,

    /// use oidc auth
    #[arg(long, value_name = "BOOL", num_args = 0..=1, default_missing_value = "true")]
    pub oidc: Option<bool>,

    /// expected audience on OIDC JWT
    #[arg(long = "oidc-aud")]
    pub oidc_aud: Option<String>,

    /// expected issuer of OIDC JWT
    #[arg(long = "oidc-issuer")]
    pub oidc_issuer: Option<String>,

    /// URI for JWKS listing for JWTs
    #[arg(long = "oidc-jwksuri")]
    pub oidc_jwksuri: Option<String>,

    /// field containing the permissions of an OIDC JWT
    #[arg(long = "oidc-roles-claim")]
    pub oidc_roles_claim: Option<String>,

    /// field containing the username of an OIDC JWT, ex (email)
    #[arg(long = "oidc-username-claim")]
    pub oidc_username_claim: Option<String>,
}

impl Cli {
    /// 显式给出的参数，键为参数名
    pub fn flag_values(&self) -> FlagValues {
        let mut flags = FlagValues::new();
        if self.debug {
            flags.insert("debug".to_string(), Value::Bool(true));
        }

        let Commands::Serve(args) = &self.command;
        if let Some(enabled) = args.oidc {
            flags.insert("oidc".to_string(), Value::Bool(enabled));
        }

        let strings = [
            ("listen", &args.listen),
            ("oidc-aud", &args.oidc_aud),
            ("oidc-issuer", &args.oidc_issuer),
            ("oidc-jwksuri", &args.oidc_jwksuri),
            ("oidc-roles-claim", &args.oidc_roles_claim),
            ("oidc-username-claim", &args.oidc_username_claim),
        ];
        for (flag, value) in strings {
            if let Some(value) = value {
                flags.insert(flag.to_string(), Value::Str(value.clone()));
            }
        }
        flags
    }
}
