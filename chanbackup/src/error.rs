// chanbackup maintains and recovers a Lightning-style node's static channel
// backup.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] hsmcore::ConfigError),
    #[error("seed store error: {0}")]
    Seed(#[from] hsmcore::SeedError),
    #[error("SCB engine error: {0}")]
    Scb(#[from] hsmcore::ScbError),

    #[error("channel list is not valid TOML: {0}")]
    ChannelListToml(#[from] toml::de::Error),
    #[error("channel list entry has malformed hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("hex field has the wrong length: expected {expected}, got {got}")]
    WrongLength { expected: usize, got: usize },

    #[error("no backup has been received from this peer yet")]
    NoPeerStorage,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
