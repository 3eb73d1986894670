use odegen::*;

fn render(block: &StatementBlock) -> String {
    block.render_code(&ExportOptions::default()).unwrap()
}

#[test]
fn explicit_euler_primal_step_is_fully_unrolled() {
    let mut export = IntegratorExport::explicit_runge_kutta(ButcherTableau::explicit_euler());
    export
        .set_model("acado_rhs", "acado_diffs")
        .unwrap();
    export.set_dimensions(1, 0).unwrap();
    export.set_grid(Grid::equidistant(0.0, 1.0, 1).unwrap()).unwrap();
    export
        .set_sensitivity_mode(SensitivityMode::None)
        .unwrap();
    export.setup().unwrap();

    let mut block = StatementBlock::new();
    export.get_code(&mut block).unwrap();
    let code = render(&block);
    // h = 1 and b = 1 fold away: x += k in one statement, no loops
    assert!(code.contains("rk_xxx[0] = rk_eta[0];"));
    assert!(code.contains("acado_rhs( rk_xxx, rk_kkk );"));
    assert!(code.contains("rk_eta[0] = rk_kkk[0] + rk_eta[0];"));
    assert!(!code.contains("for ("));
    assert!(!code.contains("rk_diffsPrev"));
}

#[test]
fn forward_sensitivities_live_in_the_state_vector() {
    let mut export = IntegratorExport::explicit_runge_kutta(ButcherTableau::erk4());
    export
        .set_differential_equation(
            SymbolicFunction::new("acado_rhs", 3, 2),
            SymbolicFunction::new("acado_diffs", 3, 6),
        )
        .unwrap();
    export.set_dimensions(2, 1).unwrap();
    export.set_grid(Grid::equidistant(0.0, 0.5, 1).unwrap()).unwrap();
    export.setup().unwrap();

    let mut decls = StatementBlock::new();
    export.get_data_declarations(&mut decls).unwrap();
    let decl_text = render(&decls);
    // rk_eta carries x (2), u (1) and the 2x3 sensitivity block
    assert!(!decl_text.contains("rk_eta"));
    let mut code = StatementBlock::new();
    export.get_code(&mut code).unwrap();
    let text = render(&code);
    assert!(text.contains("acado_integrate"));
    assert!(text.contains("rk_eta[3] = 1.000000000000000e0;"));
    assert!(text.contains("rk_eta[7] = 1.000000000000000e0;"));
}

#[test]
fn emission_is_all_or_nothing() {
    let export = IntegratorExport::discrete_time();
    let mut block = StatementBlock::new();
    block.add_comment("existing content");
    assert!(export.get_code(&mut block).is_err());
    assert!(export.get_data_declarations(&mut block).is_err());
    assert_eq!(block.len(), 1);
}

#[test]
fn registry_round_trip_generates_code() {
    let registry = IntegratorRegistry::with_default_schemes();
    let mut export = registry.create(IntegratorKind::GaussLegendre4).unwrap();
    export
        .set_differential_equation(
            SymbolicFunction::new("acado_rhs", 2, 2),
            SymbolicFunction::new("acado_diffs", 2, 4),
        )
        .unwrap();
    export.set_grid(Grid::equidistant(0.0, 1.0, 1).unwrap()).unwrap();
    export.setup().unwrap();

    let mut protos = StatementBlock::new();
    export.get_function_declarations(&mut protos).unwrap();
    let text = render(&protos);
    assert!(text.contains("acado_solve_dim4_system"));
    assert!(text.contains("acado_solve_dim4_system_reuse"));

    let mut code = StatementBlock::new();
    export.get_code(&mut code).unwrap();
    let body = render(&code);
    assert!(body.contains("rk_A"));
    assert!(body.contains("rk_dim4_perm"));
}

#[test]
fn registry_misses_produce_no_partial_output() {
    let registry = IntegratorRegistry::empty();
    let result = registry.create(IntegratorKind::ExplicitEuler);
    assert!(matches!(result, Err(CodegenError::UnknownIntegratorType(_))));
}

#[test]
fn discrete_time_with_a_linear_input_partition() {
    let mut export = IntegratorExport::discrete_time();
    export
        .set_linear_input(dmatrix![1.0], dmatrix![0.5], dmatrix![1.0])
        .unwrap();
    export
        .set_differential_equation(
            SymbolicFunction::new("step_map", 3, 1),
            SymbolicFunction::new("step_map_diffs", 3, 3),
        )
        .unwrap();
    export.set_dimensions(2, 1).unwrap();
    export.set_grid(Grid::new(vec![0.0, 1.0, 2.0]).unwrap()).unwrap();
    export.setup().unwrap();

    let mut code = StatementBlock::new();
    export.get_code(&mut code).unwrap();
    let text = render(&code);
    // the folded transition is the matrix itself
    assert!(text.contains("5.000000000000000e-1*rk_xtmp[0]"));
    assert!(text.contains("step_map( rk_xxx, rk_kkk );"));
}

#[test]
fn narx_export_generates_its_own_model_functions() {
    let registry = IntegratorRegistry::with_default_schemes();
    let mut export = registry.create(IntegratorKind::Narx).unwrap();
    // one signal, delay one, cubic polynomial: monomials x, x^2, x^3
    export
        .set_narx_model(1, dmatrix![0.9, 0.0, -0.1])
        .unwrap();
    export.set_grid(Grid::equidistant(0.0, 2.0, 2).unwrap()).unwrap();
    export.setup().unwrap();

    let mut code = StatementBlock::new();
    export.get_code(&mut code).unwrap();
    let text = render(&code);
    assert!(text.contains("acado_narx_rhs"));
    assert!(text.contains("acado_narx_diffs"));
    // the monomial products are staged, the coefficients stay literal
    assert!(text.contains("narx_mem[2] = in[0]*in[0]*in[0];"));
    assert!(text.contains("out[0] = 9.000000000000000e-1*narx_mem[0] - 1.000000000000000e-1*narx_mem[2];"));

    // the generated model functions are not redeclared as externals
    let mut protos = StatementBlock::new();
    export.get_function_declarations(&mut protos).unwrap();
    let proto_text = render(&protos);
    assert_eq!(proto_text.matches("acado_narx_rhs").count(), 1);
}

#[test]
fn narx_with_an_external_model_steps_the_full_state() {
    let mut export = IntegratorExport::narx(3);
    export.set_model("narx_f", "narx_df").unwrap();
    export.set_dimensions(2, 0).unwrap();
    export.set_grid(Grid::equidistant(0.0, 1.0, 1).unwrap()).unwrap();
    export.setup().unwrap();

    let mut code = StatementBlock::new();
    export.get_code(&mut code).unwrap();
    let text = render(&code);
    assert!(text.contains("narx_f( rk_xxx, rk_kkk );"));
    assert!(text.contains("narx_df( rk_xxx, rk_diffsNew2 );"));
    assert!(text.contains("rk_eta[0] = rk_kkk[0];"));
    assert!(text.contains("rk_eta[1] = rk_kkk[1];"));

    // the named routines are declared as externals
    let mut protos = StatementBlock::new();
    export.get_function_declarations(&mut protos).unwrap();
    let proto_text = render(&protos);
    assert!(proto_text.contains("narx_f"));
    assert!(proto_text.contains("narx_df"));
}

#[test]
fn narx_rejects_controls_and_partitions() {
    let mut export = IntegratorExport::narx(2);
    export.set_narx_model(2, dmatrix![1.0, 0.0, 0.0, 0.0, 0.0]).unwrap();
    export.set_dimensions(2, 1).unwrap();
    export.set_grid(Grid::equidistant(0.0, 1.0, 1).unwrap()).unwrap();
    assert!(matches!(
        export.setup(),
        Err(CodegenError::UnsupportedConfiguration(_))
    ));
}

#[test]
fn generated_code_has_balanced_braces() {
    let mut export = IntegratorExport::explicit_runge_kutta(ButcherTableau::erk3());
    export
        .set_differential_equation(
            SymbolicFunction::new("acado_rhs", 2, 2),
            SymbolicFunction::new("acado_diffs", 2, 4),
        )
        .unwrap();
    export.set_grid(Grid::equidistant(0.0, 3.0, 3).unwrap()).unwrap();
    export.set_num_steps(vec![1, 2, 3]).unwrap();
    export.setup().unwrap();

    let mut code = StatementBlock::new();
    export.get_code(&mut code).unwrap();
    let text = render(&code);
    assert_eq!(
        text.matches('{').count(),
        text.matches('}').count()
    );
    assert!(text.contains("for (run1 = 0; run1 < 2; ++run1)"));
    assert!(text.contains("for (run1 = 0; run1 < 3; ++run1)"));
}
