// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod auth;
pub mod channel_registry;
pub mod config;
pub mod connection_limit;
pub mod conversation;
pub mod error;
pub mod fanout;
pub mod handler;
pub mod http;
pub mod metrics;
pub mod notify;
pub mod protocol;
pub mod rate_limit;
pub mod relay;
pub mod session;
pub mod store;
