use btlink_driver::crypto::{dh_request, process};
use btlink_driver::{CryptoOp, CryptoStatus};
use serde::Serialize;

use crate::cmd::SelftestArgs;
use crate::exit::{CliError, CliResult, HEALTH_CHECK_FAILED, SUCCESS, USAGE};
use crate::output::{pass_fail, print_json, print_rows, OutputFormat};

const CURVES: [(&str, CryptoOp, CryptoOp); 2] = [
    ("p192", CryptoOp::P192PublicKey, CryptoOp::P192DhKey),
    ("p256", CryptoOp::P256PublicKey, CryptoOp::P256DhKey),
];

#[derive(Debug, Serialize)]
struct CurveCheck {
    curve: &'static str,
    round: usize,
    agreed: bool,
    invalid_key_rejected: bool,
    detail: String,
}

impl CurveCheck {
    fn passed(&self) -> bool {
        self.agreed && self.invalid_key_rejected
    }
}

#[derive(Debug, Serialize)]
struct SelftestOutput {
    checks: Vec<CurveCheck>,
    overall: &'static str,
}

pub fn run(args: SelftestArgs, format: OutputFormat) -> CliResult<i32> {
    if args.rounds == 0 {
        return Err(CliError::new(USAGE, "--rounds must be at least 1"));
    }

    let mut checks = Vec::with_capacity(CURVES.len() * args.rounds);
    for (curve, public_op, dh_op) in CURVES {
        for round in 1..=args.rounds {
            let check = check_curve(curve, public_op, dh_op, round);
            tracing::debug!(curve, round, passed = check.passed(), "key agreement checked");
            checks.push(check);
        }
    }

    let failed = checks.iter().any(|check| !check.passed());
    let output = SelftestOutput {
        checks,
        overall: if failed { "fail" } else { "pass" },
    };
    print_selftest(&output, format);

    Ok(if failed { HEALTH_CHECK_FAILED } else { SUCCESS })
}

/// Two fresh key pairs must agree on one secret, and a point off the curve
/// must be refused.
fn check_curve(curve: &'static str, public_op: CryptoOp, dh_op: CryptoOp, round: usize) -> CurveCheck {
    let failed = |detail: String| CurveCheck {
        curve,
        round,
        agreed: false,
        invalid_key_rejected: false,
        detail,
    };

    let a = process(public_op, &[]);
    let b = process(public_op, &[]);
    if a.status != CryptoStatus::Success || b.status != CryptoStatus::Success {
        return failed(format!("key generation failed: {:?}/{:?}", a.status, b.status));
    }
    let key_len = public_op.scalar_len() * 2;
    let (pub_a, priv_a) = a.payload.split_at(key_len);
    let (pub_b, priv_b) = b.payload.split_at(key_len);

    let ab = process(dh_op, &dh_request(pub_b, priv_a, 1));
    let ba = process(dh_op, &dh_request(pub_a, priv_b, 2));
    let agreed = ab.status == CryptoStatus::Success
        && ba.status == CryptoStatus::Success
        && ab.payload.len() == dh_op.response_len()
        && ab.payload == ba.payload;

    let off_curve = vec![0x11; key_len];
    let bogus = process(dh_op, &dh_request(&off_curve, priv_a, 3));
    let invalid_key_rejected = bogus.status == CryptoStatus::InvalidPublicKey;

    let detail = if agreed {
        format!("{}-byte shared secret", ab.payload.len())
    } else {
        format!("secrets differ ({:?}/{:?})", ab.status, ba.status)
    };
    CurveCheck {
        curve,
        round,
        agreed,
        invalid_key_rejected,
        detail,
    }
}

fn print_selftest(output: &SelftestOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(output),
        OutputFormat::Table => print_rows(
            &["CURVE", "ROUND", "AGREEMENT", "BAD KEY", "DETAIL"],
            output
                .checks
                .iter()
                .map(|check| {
                    vec![
                        check.curve.to_string(),
                        check.round.to_string(),
                        pass_fail(check.agreed).to_string(),
                        pass_fail(check.invalid_key_rejected).to_string(),
                        check.detail.clone(),
                    ]
                })
                .collect(),
        ),
        OutputFormat::Pretty => {
            println!("btlink selftest\n");
            for check in &output.checks {
                println!(
                    "  [{:>4}] {} round {:<3} {}",
                    pass_fail(check.passed()),
                    check.curve,
                    check.round,
                    check.detail
                );
            }
            println!("\n  Result: {}", output.overall);
        }
    }
}
