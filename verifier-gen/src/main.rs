use base64::{Engine as _, engine::general_purpose::STANDARD};
use clap::Parser;
use keychain_auth::dwt::CREDENTIAL_KEY_LEN;
use keychain_auth::program::opcode;
use keychain_auth::program::{ProgramInstancer, TemplateInstancer, Variant};

/// Instantiate the delegated-signature verifier program for a set of
/// credential keys and an origin, and print its bytecode and address.
///
/// The address is the account a session-key holder signs for; it only depends
/// on the keys, the origin and the variant, so running this twice gives the
/// same result.
#[derive(Parser, Debug)]
#[command(name = "verifier-gen", version, about)]
struct Args {
    /// Compressed P-256 credential public key (33 bytes, hex). Repeat for a
    /// multi-key program (at most 3).
    #[arg(long = "key", required = true)]
    keys: Vec<String>,

    /// Web origin the ceremonies run on, e.g. https://wallet.example
    #[arg(long)]
    origin: String,

    /// Build the multi-key variant even for a single key.
    #[arg(long, default_value_t = false)]
    multi_key: bool,

    /// Allow transactions authorized by the program to rekey the account.
    /// Implies --multi-key.
    #[arg(long, default_value_t = false)]
    rotation: bool,

    /// Also print the decoded instruction listing.
    #[arg(long, default_value_t = false)]
    listing: bool,

    /// Print a single JSON object instead of text
    #[arg(long, default_value_t = false)]
    json: bool,
}

fn parse_key(value: &str) -> Result<[u8; CREDENTIAL_KEY_LEN], String> {
    let raw = hex::decode(value.trim()).map_err(|e| format!("key {}: {}", value, e))?;
    raw.as_slice()
        .try_into()
        .map_err(|_| format!("key {}: expected {} bytes, got {}", value, CREDENTIAL_KEY_LEN, raw.len()))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let keys = args
        .keys
        .iter()
        .map(|k| parse_key(k))
        .collect::<Result<Vec<_>, _>>()?;

    let variant = if args.multi_key || args.rotation || keys.len() > 1 {
        Variant::MultiKey
    } else {
        Variant::SingleKey
    };
    let instancer = TemplateInstancer {
        variant,
        allow_rotation: args.rotation,
    };
    let program = instancer.deploy_or_derive(&keys, &args.origin).await?;
    let bytecode = STANDARD.encode(&program.bytecode);

    if args.json {
        let out = serde_json::json!({
            "address": program.address.to_string(),
            "bytecode": bytecode,
            "variant": format!("{:?}", variant),
            "origin": program.template.origin(),
            "keys": args.keys,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("address: {}", program.address);
    println!("variant: {:?}", variant);
    println!("size: {} bytes", program.bytecode.len());
    println!("bytecode: {}", bytecode);

    if args.listing {
        for (i, op) in opcode::decode(&program.bytecode)?.iter().enumerate() {
            println!("{:>4}  {:?}", i, op);
        }
    }

    Ok(())
}
