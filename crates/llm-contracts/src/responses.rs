// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2024 Jonathan Lee
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License version 3
// as published by the Free Software Foundation.
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU Affero General Public License for more details.
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see https://www.gnu.org/licenses/.

use crate::types::FinishReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub id: Uuid,
    pub request_id: Uuid,
    pub text: String,
    pub model: String,
    pub usage: Usage,
    pub finish_reason: FinishReason,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub request_id: Uuid,
    pub content_delta: String,
    pub is_final: bool,
    pub usage: Option<Usage>,
}

impl GenerationResponse {
    pub fn text_only(request_id: Uuid, model: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            request_id,
            text: text.into(),
            model: model.into(),
            usage: Usage::default(),
            finish_reason: FinishReason::Stop,
            created_at: Utc::now(),
        }
    }
}

impl StreamChunk {
    pub fn delta(request_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            request_id,
            content_delta: content.into(),
            is_final: false,
            usage: None,
        }
    }

    pub fn finished(request_id: Uuid, usage: Usage) -> Self {
        Self {
            request_id,
            content_delta: String::new(),
            is_final: true,
            usage: Some(usage),
        }
    }
}
