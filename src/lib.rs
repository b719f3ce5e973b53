// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

pub mod channel;
pub mod config;
pub mod errors;
pub mod exchange;
pub mod lifecycle;
pub mod manager;
pub mod queue;
pub mod topology;
pub mod transport;
