//! # Hardware Info
//!
//! Purpose: Assemble a structured description of a projector from a fixed
//! sequence of single-value queries.
//!
//! Scalar answers arrive quoted (`"EPSON12345"`); warning, error and timer
//! answers arrive as JSON text. Decoding happens after the exchange is over,
//! so a malformed field never taints the connection.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::{exchange, unquote};
use crate::conn::Connection;
use crate::error::{ClientError, ClientResult};

/// Queries issued to build a [`HardwareInfo`], in order.
pub const DIAGNOSTIC_COMMANDS: [&str; 12] = [
    "modelname ?",
    "ipv4_ip_address ?",
    "ipv4_default_gateway ?",
    "ipv4_dns_server1 ?",
    "ipv4_dns_server2 ?",
    "mac_address ?",
    "serialnum ?",
    "filter_status ?",
    "power_status ?",
    "warning ?",
    "error ?",
    "timer ?",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub ip_address: String,
    pub gateway: String,
    pub dns: Vec<String>,
    pub mac_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareInfo {
    pub model_name: String,
    pub serial_number: String,
    pub filter_status: String,
    pub power_status: String,
    pub network: NetworkInfo,
    pub warning_status: Value,
    pub error_status: Value,
    pub timer_info: Value,
}

impl HardwareInfo {
    /// Builds the record from raw answers given in [`DIAGNOSTIC_COMMANDS`] order.
    pub fn from_answers(answers: &[String]) -> ClientResult<Self> {
        let [model, ip, gateway, dns1, dns2, mac, serial, filter, power, warning, error, timer] =
            answers
        else {
            return Err(ClientError::Protocol(format!(
                "expected {} answers, got {}",
                DIAGNOSTIC_COMMANDS.len(),
                answers.len()
            )));
        };

        Ok(HardwareInfo {
            model_name: unquote(model).to_string(),
            serial_number: unquote(serial).to_string(),
            filter_status: unquote(filter).to_string(),
            power_status: unquote(power).to_string(),
            network: NetworkInfo {
                ip_address: unquote(ip).to_string(),
                gateway: unquote(gateway).to_string(),
                dns: vec![unquote(dns1).to_string(), unquote(dns2).to_string()],
                mac_address: unquote(mac).to_string(),
            },
            warning_status: decode_json("warning ?", warning)?,
            error_status: decode_json("error ?", error)?,
            timer_info: decode_json("timer ?", timer)?,
        })
    }
}

/// Runs every diagnostic query on `conn` and returns the raw answers.
pub(crate) async fn query_all(
    conn: &mut dyn Connection,
    timeout: Duration,
) -> ClientResult<Vec<String>> {
    tracing::info!(parent: conn.span(), "getting hardware info");
    let mut answers = Vec::with_capacity(DIAGNOSTIC_COMMANDS.len());
    for command in DIAGNOSTIC_COMMANDS {
        answers.push(exchange(conn, command, timeout).await?);
    }
    Ok(answers)
}

fn decode_json(command: &str, text: &str) -> ClientResult<Value> {
    serde_json::from_str(text)
        .map_err(|err| ClientError::Protocol(format!("{} returned malformed JSON: {}", command, err)))
}
