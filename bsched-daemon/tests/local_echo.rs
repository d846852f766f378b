// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A root kernel submitted with no destination never touches the
//! socket pipeline at all: it runs, commits and shuts the process down
//! entirely on the local CPU pipeline.

mod common;

use bsched_kernel::EchoKernel;

#[test]
fn local_root_echo_exits_with_its_own_payload() {
    let factory = common::start_node(common::loopback(1, 0), common::registry());

    factory.send(Box::new(EchoKernel::new(42)));

    assert_eq!(factory.wait(), 42);
}
