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

use std::io;

use flexi_logger::FlexiLoggerError;
use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("logger init failed: {0}")]
    Logger(#[from] FlexiLoggerError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("stats client init failed: {0}")]
    Stats(String),
    #[error("spawn thread {0} failed: {1}")]
    ThreadSpawn(&'static str, io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
