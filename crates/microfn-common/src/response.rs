//! Response normalization shared by the ephemeral gateway and the
//! persistent runtime: any handler return value is coerced into a
//! [`HandlerResponse`].

use serde_json::Value;

use crate::HandlerResponse;

/// Coerce an arbitrary handler return value into the response contract.
///
/// A JSON object carrying any of `statusCode` / `headers` / `body` is
/// treated as response-shaped: the status code defaults to 200, headers to
/// an empty map, and a non-string body is JSON-serialized. Anything else is
/// the body itself. A body that cannot be serialized degrades to a safe 500
/// instead of propagating an error.
pub fn normalize(value: Value) -> HandlerResponse {
    let mut response = HandlerResponse::default();

    match value {
        Value::Object(map)
            if map.contains_key("statusCode")
                || map.contains_key("headers")
                || map.contains_key("body") =>
        {
            if let Some(code) = map.get("statusCode") {
                response.status_code = code
                    .as_u64()
                    .and_then(|c| u16::try_from(c).ok())
                    .unwrap_or(200);
            }
            if let Some(Value::Object(headers)) = map.get("headers") {
                for (key, val) in headers {
                    let rendered = match val {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    response.headers.insert(key.clone(), rendered);
                }
            }
            match map.get("body") {
                None => {}
                Some(Value::String(s)) => response.body = s.clone(),
                Some(other) => return serialize_body(response, other),
            }
            response
        }
        Value::String(s) => {
            response.body = s;
            response
        }
        Value::Null => response,
        other => serialize_body(response, &other),
    }
}

fn serialize_body(mut response: HandlerResponse, body: &Value) -> HandlerResponse {
    match serde_json::to_string(body) {
        Ok(rendered) => {
            response.body = rendered;
            response
        }
        Err(err) => HandlerResponse::internal_error(format!(
            "handler returned a non-serializable response: {err}"
        )),
    }
}
