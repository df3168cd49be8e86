use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde::Serialize;
use storefront_checkout::{
    checkout::generate_order_ref,
    config::{self, CheckoutConfig},
    payments::{
        gateway::describe_response_code, CardInput, GatewayParams, GatewaySigner,
        GatewayVerifier, HttpPaymentStatusClient, PaymentRequest, PaymentStatusClient,
    },
};
use tracing::debug;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::load_config().context("failed to load checkout config")?;
    config::init_tracing(&config.log_level, config.log_json);

    match cli.command {
        Commands::Sign(args) => handle_sign(&config, args, cli.json)?,
        Commands::Verify(args) => handle_verify(&config, args, cli.json)?,
        Commands::Card(args) => handle_card(args, cli.json)?,
        Commands::Status(args) => handle_status(&config, args, cli.json).await?,
    }

    Ok(())
}

#[derive(Parser)]
#[command(
    name = "checkout-cli",
    about = "Operator tools for the storefront checkout payment gateway",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a signed gateway redirect URL
    Sign(SignArgs),
    /// Verify a gateway return query string
    Verify(VerifyArgs),
    /// Run the card checks against a card
    Card(CardArgs),
    /// Ask the payment status endpoint about a bank transfer
    Status(StatusArgs),
}

#[derive(Args)]
struct SignArgs {
    #[arg(long, help = "Order reference; a fresh one is generated when omitted")]
    order_ref: Option<String>,
    #[arg(long, help = "Amount in whole currency units")]
    amount: u64,
    #[arg(long, help = "Order description shown by the gateway")]
    description: Option<String>,
    #[arg(long, help = "Preselect a bank on the gateway page")]
    bank_code: Option<String>,
    #[arg(long, help = "Gateway page locale (defaults to config)")]
    locale: Option<String>,
    #[arg(long, help = "Shopper IP address")]
    ip: Option<String>,
}

#[derive(Args)]
struct VerifyArgs {
    #[arg(help = "Query string from the return URL, with or without the leading '?'")]
    query: String,
}

#[derive(Args)]
struct CardArgs {
    #[arg(long)]
    number: String,
    #[arg(long, help = "Expiry as MM/YY")]
    expiry: String,
    #[arg(long)]
    cvv: String,
    #[arg(long, help = "Name printed on the card")]
    holder: String,
}

#[derive(Args)]
struct StatusArgs {
    #[arg(long)]
    order_ref: String,
}

fn handle_sign(config: &CheckoutConfig, args: SignArgs, json: bool) -> Result<()> {
    let order_ref = args.order_ref.unwrap_or_else(generate_order_ref);
    let description = args
        .description
        .unwrap_or_else(|| format!("Payment for order {}", order_ref));
    let mut request = PaymentRequest::new(order_ref, args.amount, description);
    request.bank_code = args.bank_code;
    request.locale = args.locale;
    request.client_ip = args.ip;

    let signer = GatewaySigner::new(config.gateway.clone());
    let redirect = signer
        .redirect(&request)
        .context("failed to build gateway redirect")?;
    debug!(canonical = %redirect.canonical, "signed canonical query");

    if json {
        print_json(&redirect)?;
    } else {
        println!("{}", redirect.url);
        println!("Expires at: {}", redirect.expires_at.to_rfc3339());
    }
    Ok(())
}

fn parse_query(raw: &str) -> GatewayParams {
    let query = raw
        .trim()
        .rsplit_once('?')
        .map_or(raw.trim(), |(_, q)| q);
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

#[derive(Serialize)]
struct VerifyReport {
    authentic: bool,
    success: bool,
    order_ref: Option<String>,
    amount: Option<u64>,
    response_code: Option<String>,
    message: String,
}

fn handle_verify(config: &CheckoutConfig, args: VerifyArgs, json: bool) -> Result<()> {
    let params = parse_query(&args.query);
    let verifier = GatewayVerifier::new(config.gateway.clone());

    let report = match verifier.verify(&params) {
        Ok(callback) => VerifyReport {
            authentic: true,
            success: callback.is_success(),
            order_ref: Some(callback.order_ref),
            amount: Some(callback.amount),
            response_code: Some(callback.response_code),
            message: callback.message.to_string(),
        },
        Err(err) => {
            let code = params.get("vnp_ResponseCode").cloned();
            VerifyReport {
                authentic: verifier.verify_signature(&params),
                success: false,
                order_ref: params.get("vnp_TxnRef").cloned(),
                amount: None,
                message: match &code {
                    Some(code) if verifier.verify_signature(&params) => {
                        format!("{} ({})", err, describe_response_code(code).message)
                    }
                    _ => err.to_string(),
                },
                response_code: code,
            }
        }
    };

    if json {
        print_json(&report)?;
    } else {
        println!(
            "authentic: {} • success: {} • order: {} • {}",
            report.authentic,
            report.success,
            report.order_ref.as_deref().unwrap_or("-"),
            report.message
        );
    }
    Ok(())
}

fn handle_card(args: CardArgs, json: bool) -> Result<()> {
    let input = CardInput::new(args.number, args.expiry, args.cvv, args.holder);
    let check = input.check();
    if json {
        print_json(&check)?;
    } else {
        println!(
            "brand: {:?} • number: {} • expiry: {} • cvv: {} • holder: {}",
            check.brand, check.number_ok, check.expiry_ok, check.cvv_ok, check.holder_ok
        );
        match check.first_problem() {
            None => println!("Card details are valid"),
            Some(problem) => println!("{}", problem),
        }
    }
    Ok(())
}

async fn handle_status(config: &CheckoutConfig, args: StatusArgs, json: bool) -> Result<()> {
    let client = HttpPaymentStatusClient::new(&config.payment_status)
        .context("failed to build payment status client")?;
    let status = client
        .check(&args.order_ref)
        .await
        .with_context(|| format!("failed to fetch payment status for {}", args.order_ref))?;
    if json {
        print_json(&status)?;
    } else {
        println!(
            "order {}: {}",
            args.order_ref,
            if status.paid() { "paid" } else { "not paid yet" }
        );
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
