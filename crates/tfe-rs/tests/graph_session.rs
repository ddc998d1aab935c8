mod common;

use anyhow::Result;
use tfe_rs::eager::{AttrMap, AttrValue};
use tfe_rs::graph::PLACEHOLDER;
use tfe_rs::{Code, Graph, GraphNode, Session};

fn node(name: &str, op: &str, inputs: &[&str]) -> GraphNode {
    GraphNode {
        name: name.to_string(),
        op: op.to_string(),
        inputs: inputs.iter().map(|input| input.to_string()).collect(),
        attrs: AttrMap::new(),
        device: None,
    }
}

/// `neg = -x`, `product = x @ x`.
fn small_graph() -> Result<Graph> {
    let graph = Graph::new();
    graph.add_node(node("x", PLACEHOLDER, &[]))?;
    graph.add_node(node("neg", "Neg", &["x"]))?;
    graph.add_node(node("product", "MatMul", &["x", "x:0"]))?;
    Ok(graph)
}

#[test]
fn session_runs_fed_graph() -> Result<()> {
    let context = common::context()?;
    let graph = small_graph()?;
    assert_eq!(graph.num_nodes(), 3);
    let mut session = Session::new(&graph, &context)?;

    let x = common::matrix(&context)?;
    let outputs = session.run(&[("x", x.clone())], &["neg", "product"])?;
    assert_eq!(common::resolve_floats(&outputs[0])?, vec![-1.0, -2.0, -3.0, -4.0]);
    assert_eq!(common::resolve_floats(&outputs[1])?, vec![7.0, 10.0, 15.0, 22.0]);

    // Running again without mutations is fine.
    let outputs = session.run(&[("x", x)], &["neg"])?;
    assert_eq!(common::resolve_floats(&outputs[0])?, vec![-1.0, -2.0, -3.0, -4.0]);
    Ok(())
}

#[test]
fn missing_feed_and_unknown_fetch() -> Result<()> {
    let context = common::context()?;
    let graph = small_graph()?;
    let mut session = Session::new(&graph, &context)?;

    let err = session.run(&[], &["neg"]).unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(err.message(), "You must feed a value for placeholder tensor 'x'");

    let err = session
        .run(&[("x", common::matrix(&context)?)], &["missing"])
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
    assert_eq!(err.message(), "Node 'missing' not found in graph");
    Ok(())
}

#[test]
fn add_node_checks_names_and_inputs() -> Result<()> {
    let graph = small_graph()?;
    let err = graph.add_node(node("neg", "Neg", &["x"])).unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(err.message(), "Node 'neg' already exists in the graph");

    let err = graph.add_node(node("abs", "Abs", &["y"])).unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(graph.num_nodes(), 3);
    Ok(())
}

#[test]
fn mutating_a_run_node_fails_the_next_run() -> Result<()> {
    let context = common::context()?;
    let graph = small_graph()?;
    let mut session = Session::new(&graph, &context)?;
    let x = common::matrix(&context)?;
    session.run(&[("x", x.clone())], &["product"])?;

    graph.set_attr("product", "transpose_a", AttrValue::Bool(true))?;
    let err = session.run(&[("x", x.clone())], &["neg"]).unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);
    assert!(err
        .message()
        .starts_with("Operation 'product' was changed by setting attribute 'transpose_a' after it was run by a session."));

    // A fresh session sees the updated node.
    let mut fresh = Session::new(&graph, &context)?;
    let outputs = fresh.run(&[("x", x)], &["product"])?;
    assert_eq!(common::resolve_floats(&outputs[0])?, vec![10.0, 14.0, 14.0, 20.0]);
    Ok(())
}

#[test]
fn each_mutation_kind_is_reported() -> Result<()> {
    let context = common::context()?;
    let graph = small_graph()?;
    let x = common::matrix(&context)?;

    let mut session = Session::new(&graph, &context)?;
    session.run(&[("x", x.clone())], &["neg"])?;
    graph.set_device("neg", common::HOST_CPU)?;
    let err = session.run(&[("x", x.clone())], &["neg"]).unwrap_err();
    assert!(err.message().contains("was changed by setting the device"));

    let mut session = Session::new(&graph, &context)?;
    session.run(&[("x", x.clone())], &["neg"])?;
    graph.add_node(node("y", PLACEHOLDER, &[]))?;
    graph.update_input("neg", 0, "y")?;
    let err = session.run(&[("y", x)], &["neg"]).unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);
    assert!(err.message().contains("was changed by updating input tensor"));

    let err = graph.update_input("neg", 4, "x").unwrap_err();
    assert_eq!(err.code(), Code::OutOfRange);
    assert_eq!(err.message(), "Node 'neg' has no input 4");
    assert_eq!(graph.update_input("neg", 0, "nope").unwrap_err().code(), Code::InvalidArgument);
    Ok(())
}

#[test]
fn mutating_a_node_the_session_never_ran_is_allowed() -> Result<()> {
    let context = common::context()?;
    let graph = small_graph()?;
    let mut session = Session::new(&graph, &context)?;
    let x = common::matrix(&context)?;
    session.run(&[("x", x.clone())], &["neg"])?;

    graph.set_attr("product", "transpose_b", AttrValue::Bool(true))?;
    let outputs = session.run(&[("x", x)], &["product"])?;
    assert_eq!(common::resolve_floats(&outputs[0])?, vec![5.0, 11.0, 11.0, 25.0]);
    Ok(())
}

#[test]
fn deletion_waits_for_open_sessions() -> Result<()> {
    let context = common::context()?;
    let graph = small_graph()?;
    let mut first = Session::new(&graph, &context)?;
    let second = Session::new(&graph, &context)?;
    assert_eq!(graph.num_sessions(), 2);

    graph.request_delete();
    assert!(!graph.is_destroyed());
    assert_eq!(graph.add_node(node("z", PLACEHOLDER, &[])).unwrap_err().message(), "Graph has been deleted");
    assert_eq!(
        Session::new(&graph, &context).err().map(|err| err.code()),
        Some(Code::FailedPrecondition)
    );

    first.close();
    first.close();
    assert_eq!(graph.num_sessions(), 1);
    assert!(!graph.is_destroyed());
    let err = first.run(&[], &["neg"]).unwrap_err();
    assert_eq!(err.message(), "Session has been closed.");

    drop(second);
    assert_eq!(graph.num_sessions(), 0);
    assert!(graph.is_destroyed());
    Ok(())
}

#[test]
fn unreferenced_graph_is_destroyed_immediately() -> Result<()> {
    let graph = small_graph()?;
    graph.request_delete();
    assert!(graph.is_destroyed());
    assert_eq!(graph.num_nodes(), 0);
    Ok(())
}
