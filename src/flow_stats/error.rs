/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum KernelError {
    #[error("kernel flow entry {0} not found")]
    NotFound(u32),
    #[error("kernel flow table read failed: {0}")]
    Io(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ExportError {
    #[error("flow record sink unavailable")]
    SinkUnavailable,
    #[error("flow record sink terminated")]
    Terminated,
}

/// Errors returned to flow table producers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("flow stats request queue full")]
    QueueFull,
    #[error("flow stats request queue terminated")]
    QueueTerminated,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
