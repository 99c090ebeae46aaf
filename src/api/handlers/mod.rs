// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

pub mod health;
pub mod rpc;
