/*
 * SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
 * SPDX-License-Identifier: MIT
 *
 * Permission is hereby granted, free of charge, to any person obtaining a
 * copy of this software and associated documentation files (the "Software"),
 * to deal in the Software without restriction, including without limitation
 * the rights to use, copy, modify, merge, publish, distribute, sublicense,
 * and/or sell copies of the Software, and to permit persons to whom the
 * Software is furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL
 * THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
 * DEALINGS IN THE SOFTWARE.
 */
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BiosAttribute {
    pub current_value: String,
    /// Value staged for the next apply, when it differs from the current one.
    pub pending_value: Option<String>,
}

impl BiosAttribute {
    pub fn new(current_value: impl Into<String>) -> Self {
        BiosAttribute {
            current_value: current_value.into(),
            pending_value: None,
        }
    }

    pub fn with_pending(current_value: impl Into<String>, pending_value: impl Into<String>) -> Self {
        BiosAttribute {
            current_value: current_value.into(),
            pending_value: Some(pending_value.into()),
        }
    }
}

pub type BiosAttributes = HashMap<String, BiosAttribute>;

/// Render a raw attribute value the way desired values are written.
/// BMCs report enumerations as strings but integers and booleans natively.
pub fn attribute_value_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// The JSON value to write for `value`, typed like the attribute's current
/// value. Strings that do not parse as that type are written unchanged.
pub fn typed_attribute_value(value: &str, current: Option<&serde_json::Value>) -> serde_json::Value {
    use serde_json::Value;
    match current {
        Some(Value::Number(_)) => {
            if let Ok(n) = value.trim().parse::<i64>() {
                return Value::from(n);
            }
            if let Ok(n) = value.trim().parse::<u64>() {
                return Value::from(n);
            }
            match value.trim().parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
                Some(n) => Value::Number(n),
                None => Value::String(value.to_string()),
            }
        }
        Some(Value::Bool(_)) => match value.trim().to_ascii_lowercase().as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(value.to_string()),
        },
        _ => Value::String(value.to_string()),
    }
}
