// Copyright 2026 Ragkit Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Character-window chunking with overlap.
//!
//! Windows hold at most `chunk_size` characters. Each window after the first
//! starts `chunk_overlap` characters before the previous one ended, so
//! dropping the first `chunk_overlap` characters of every later window and
//! concatenating yields the original text. Window ends prefer a paragraph
//! break, then a line break, then any whitespace, then a hard cut.

use crate::config::ChunkingConfig;
use crate::error::RagError;
use crate::error::Result;
use crate::model::Chunk;
use crate::model::Document;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl Chunker {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        if chunk_overlap >= chunk_size {
            return Err(RagError::config(format!(
                "chunk_overlap ({chunk_overlap}) must be less than chunk_size ({chunk_size})"
            )));
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
        })
    }

    pub fn from_config(config: &ChunkingConfig) -> Result<Self> {
        Self::new(config.chunk_size, config.chunk_overlap)
    }

    /// Character spans covering `text`.
    pub fn spans(&self, text: &str) -> Vec<Span> {
        let chars: Vec<char> = text.chars().collect();
        self.spans_for(&chars)
    }

    fn spans_for(&self, chars: &[char]) -> Vec<Span> {
        let total = chars.len();
        let mut spans = Vec::new();
        let mut start = 0usize;
        while start < total {
            if total - start <= self.chunk_size {
                spans.push(Span { start, end: total });
                break;
            }
            let end = self.split_point(chars, start);
            spans.push(Span { start, end });
            start = end - self.chunk_overlap;
        }
        spans
    }

    /// End of the window starting at `start`; always beyond
    /// `start + chunk_overlap` so the next window advances.
    fn split_point(&self, chars: &[char], start: usize) -> usize {
        let hard_end = start + self.chunk_size;
        let min_end = start + self.chunk_overlap + 1;

        let paragraph = (min_end..=hard_end)
            .rev()
            .find(|&end| end >= start + 2 && chars[end - 2] == '\n' && chars[end - 1] == '\n');
        if let Some(end) = paragraph {
            return end;
        }
        let line = (min_end..=hard_end).rev().find(|&end| chars[end - 1] == '\n');
        if let Some(end) = line {
            return end;
        }
        let space = (min_end..=hard_end)
            .rev()
            .find(|&end| chars[end - 1].is_whitespace());
        space.unwrap_or(hard_end)
    }

    pub fn chunk_document(&self, document: &Document) -> Vec<Chunk> {
        let chars: Vec<char> = document.content.chars().collect();
        self.spans_for(&chars)
            .into_iter()
            .enumerate()
            .map(|(index, span)| Chunk {
                id: format!("{}_{}", document.id, index),
                document_id: document.id.clone(),
                content: chars[span.start..span.end].iter().collect(),
                start_offset: span.start,
                end_offset: span.end,
            })
            .collect()
    }
}
