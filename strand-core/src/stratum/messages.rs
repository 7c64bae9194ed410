//! Stratum JSON-RPC envelope and the typed payloads the session understands.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC message as Stratum uses it: notifications carry `id: null`,
/// there is no version field, and errors are usually `[code, message, data]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    /// Request or notification (`id` is `None`).
    Request {
        id: Option<u64>,
        method: String,
        params: Value,
    },
    Response {
        id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
}

impl JsonRpcMessage {
    pub fn request(id: u64, method: impl Into<String>, params: Value) -> Self {
        JsonRpcMessage::Request {
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        JsonRpcMessage::Request {
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn id(&self) -> Option<u64> {
        match self {
            JsonRpcMessage::Request { id, .. } => *id,
            JsonRpcMessage::Response { id, .. } => Some(*id),
        }
    }

    pub fn is_notification(&self) -> bool {
        matches!(self, JsonRpcMessage::Request { id: None, .. })
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request { method, .. } => Some(method),
            JsonRpcMessage::Response { .. } => None,
        }
    }
}

/// Human-readable text of a Stratum error value.
pub fn describe_error(error: &Value) -> String {
    match error {
        Value::Array(parts) => match (parts.first(), parts.get(1)) {
            (Some(code), Some(Value::String(msg))) => format!("{} ({})", msg, code),
            _ => error.to_string(),
        },
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Work unit from `mining.notify`. Hashes stay as the raw bytes the pool sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub job_id: String,
    pub prev_hash: Vec<u8>,
    pub coinbase1: Vec<u8>,
    pub coinbase2: Vec<u8>,
    pub merkle_branches: Vec<Vec<u8>>,
    pub version: u32,
    pub nbits: u32,
    pub ntime: u32,
    /// Abandon all previous jobs.
    pub clean_jobs: bool,
}

impl Job {
    pub fn from_stratum_params(params: &Value) -> Result<Self, String> {
        let params = params.as_array().ok_or("mining.notify params not an array")?;
        if params.len() < 9 {
            return Err("mining.notify params too short".to_string());
        }
        let job_id = params[0].as_str().ok_or("job_id not a string")?.to_string();
        let prev_hash = hex_field(&params[1], "prev_hash")?;
        let coinbase1 = hex_field(&params[2], "coinbase1")?;
        let coinbase2 = hex_field(&params[3], "coinbase2")?;
        let merkle_branches = params[4]
            .as_array()
            .ok_or("merkle_branches not an array")?
            .iter()
            .map(|b| hex_field(b, "merkle branch"))
            .collect::<Result<Vec<_>, _>>()?;
        let version = u32_field(&params[5], "version")?;
        let nbits = u32_field(&params[6], "nbits")?;
        let ntime = u32_field(&params[7], "ntime")?;
        let clean_jobs = params[8].as_bool().ok_or("clean_jobs not a bool")?;
        Ok(Self {
            job_id,
            prev_hash,
            coinbase1,
            coinbase2,
            merkle_branches,
            version,
            nbits,
            ntime,
            clean_jobs,
        })
    }
}

fn hex_field(v: &Value, name: &str) -> Result<Vec<u8>, String> {
    let s = v.as_str().ok_or_else(|| format!("{} not a string", name))?;
    hex::decode(s).map_err(|e| format!("{} hex: {}", name, e))
}

fn u32_field(v: &Value, name: &str) -> Result<u32, String> {
    let s = v.as_str().ok_or_else(|| format!("{} not a string", name))?;
    u32::from_str_radix(s, 16).map_err(|e| format!("{} hex: {}", name, e))
}

/// Share found for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitParams {
    pub job_id: String,
    pub extranonce2: Vec<u8>,
    pub ntime: u32,
    pub nonce: u32,
}

impl SubmitParams {
    /// `mining.submit` params: worker, job id, then hex fields.
    pub fn to_stratum_json(&self, worker: &str) -> Value {
        Value::Array(vec![
            Value::String(worker.to_string()),
            Value::String(self.job_id.clone()),
            Value::String(hex::encode(&self.extranonce2)),
            Value::String(format!("{:08x}", self.ntime)),
            Value::String(format!("{:08x}", self.nonce)),
        ])
    }
}

/// `mining.subscribe` result: `[subscriptions, extranonce1, extranonce2_size]`.
pub(crate) fn parse_subscribe_result(result: &Value) -> Result<(Vec<u8>, usize), String> {
    let parts = result.as_array().ok_or("subscribe result not an array")?;
    if parts.len() < 3 {
        return Err("subscribe result too short".to_string());
    }
    let extranonce1 = hex_field(&parts[1], "extranonce1")?;
    let size = parts[2]
        .as_u64()
        .ok_or("extranonce2_size not a number")?;
    Ok((extranonce1, size as usize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn notification_and_response_shapes() {
        let msg: JsonRpcMessage = serde_json::from_str(
            r#"{"id":null,"method":"mining.set_difficulty","params":[512]}"#,
        )
        .unwrap();
        assert!(msg.is_notification());
        assert_eq!(msg.method(), Some("mining.set_difficulty"));

        let msg: JsonRpcMessage =
            serde_json::from_str(r#"{"id":4,"result":true,"error":null}"#).unwrap();
        assert_eq!(
            msg,
            JsonRpcMessage::Response {
                id: 4,
                result: Some(json!(true)),
                error: None
            }
        );
    }

    #[test]
    fn request_serializes_with_id() {
        let text =
            serde_json::to_string(&JsonRpcMessage::request(7, "mining.authorize", json!(["w", "x"])))
                .unwrap();
        assert_eq!(
            text,
            r#"{"id":7,"method":"mining.authorize","params":["w","x"]}"#
        );
    }

    #[test]
    fn job_from_notify_params() {
        let params = json!([
            "job1",
            "00".repeat(32),
            "aa",
            "bb",
            ["cc", "dd"],
            "20000000",
            "1d00ffff",
            "5a5a5a5a",
            true
        ]);
        let job = Job::from_stratum_params(&params).unwrap();
        assert_eq!(job.job_id, "job1");
        assert_eq!(job.prev_hash.len(), 32);
        assert_eq!(job.merkle_branches, vec![vec![0xcc], vec![0xdd]]);
        assert_eq!(job.version, 0x2000_0000);
        assert_eq!(job.nbits, 0x1d00_ffff);
        assert!(job.clean_jobs);

        assert!(Job::from_stratum_params(&json!(["job1"])).is_err());
        let mut bad = params.clone();
        bad[2] = json!("zz");
        assert!(Job::from_stratum_params(&bad).is_err());
    }

    #[test]
    fn submit_params_hex() {
        let p = SubmitParams {
            job_id: "j".into(),
            extranonce2: vec![0xde, 0xad],
            ntime: 0x6543_2100,
            nonce: 0x1234_5678,
        };
        assert_eq!(
            p.to_stratum_json("worker"),
            json!(["worker", "j", "dead", "65432100", "12345678"])
        );
    }

    #[test]
    fn error_descriptions() {
        assert_eq!(
            describe_error(&json!([23, "Low difficulty share", null])),
            "Low difficulty share (23)"
        );
        assert_eq!(describe_error(&json!({"code": 1, "message": "nope"})), "nope");
        assert_eq!(describe_error(&json!("bad")), "bad");
    }

    #[test]
    fn subscribe_result() {
        let r = json!([[["mining.notify", "ae6812eb4cd7735a302a8a9dd95cf71f"]], "08000002", 4]);
        assert_eq!(parse_subscribe_result(&r).unwrap(), (vec![8, 0, 0, 2], 4));
        assert!(parse_subscribe_result(&json!(true)).is_err());
    }
}
