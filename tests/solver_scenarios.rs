//! End-to-end solver scenarios: linear goals, inequality activation,
//! priorities, saturation, rotations and free-variable restriction.

use std::sync::Arc;

use approx::assert_relative_eq;
use nalgebra::{DMatrix, DVector};
use sim_ik::{
    AffineFunction, Backtracking, BlockIndices, ComparisonType, ConfigSpace, Constant,
    ErrorNormBased, FixedSequence, HierarchicalSolver, ImplicitConstraint, Saturation,
    SpaceIdentity, Status,
};

fn equality_constraint(name: &str, a: DMatrix<f64>, b: DVector<f64>) -> ImplicitConstraint {
    let rows = a.nrows();
    ImplicitConstraint::with_comparison(
        Arc::new(AffineFunction::new(name, a, b)),
        vec![ComparisonType::Equality; rows],
    )
}

#[test]
fn single_linear_equality_converges_in_two_iterations() {
    let mut solver = HierarchicalSolver::new(ConfigSpace::vector(3));
    solver.set_squared_error_threshold(1e-8);
    solver.set_max_iterations(2);
    solver
        .add(
            equality_constraint(
                "two-plane goal",
                DMatrix::from_row_slice(2, 3, &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0]),
                DVector::from_vec(vec![1.0, 2.0]),
            ),
            0,
        )
        .expect("fresh constraint");

    let mut q = DVector::zeros(3);
    let status = solver.solve(&mut q, &mut Backtracking::default());
    assert_eq!(status, Status::Success);
    assert_relative_eq!(q[0], 1.0, epsilon = 1e-4);
    assert_relative_eq!(q[1], 2.0, epsilon = 1e-4);
    // The third coordinate is unconstrained and must not move.
    assert_relative_eq!(q[2], 0.0, epsilon = 1e-12);
}

#[test]
fn satisfied_inequality_is_deactivated_and_leaves_q_alone() {
    let mut solver = HierarchicalSolver::new(ConfigSpace::vector(1));
    solver.set_squared_error_threshold(1e-8);
    solver.set_inequality_threshold(0.01);
    solver.set_max_iterations(1);
    let margin = ImplicitConstraint::with_comparison(
        Arc::new(AffineFunction::new(
            "stay above one",
            DMatrix::from_row_slice(1, 1, &[1.0]),
            DVector::from_vec(vec![1.0]),
        )),
        vec![ComparisonType::Superior],
    );
    solver.add(margin, 0).expect("fresh constraint");

    // f(5) = 4 >= threshold: the row is inactive and there is nothing to
    // descend on.
    let mut q = DVector::from_vec(vec![5.0]);
    let status = solver.solve(&mut q, &mut Constant::default());
    assert_eq!(status, Status::Success);
    assert_relative_eq!(q[0], 5.0, epsilon = 1e-12);
}

#[test]
fn violated_inequality_pushes_into_the_feasible_set() {
    let mut solver = HierarchicalSolver::new(ConfigSpace::vector(1));
    solver.set_squared_error_threshold(1e-8);
    solver.set_inequality_threshold(0.01);
    solver.set_max_iterations(10);
    let margin = ImplicitConstraint::with_comparison(
        Arc::new(AffineFunction::new(
            "stay above one",
            DMatrix::from_row_slice(1, 1, &[1.0]),
            DVector::from_vec(vec![1.0]),
        )),
        vec![ComparisonType::Superior],
    );
    solver.add(margin, 0).expect("fresh constraint");

    let mut q = DVector::from_vec(vec![-2.0]);
    let status = solver.solve(&mut q, &mut Constant::default());
    assert_eq!(status, Status::Success);
    assert!(q[0] >= 1.0 - 1e-6, "q = {} should satisfy q - 1 >= 0", q[0]);
}

#[test]
fn two_level_priority_solves_level_zero_exactly() {
    let mut solver = HierarchicalSolver::new(ConfigSpace::vector(2));
    solver.set_squared_error_threshold(1e-10);
    solver.set_max_iterations(10);
    solver.set_last_is_optional(true);
    solver
        .add(
            equality_constraint(
                "q0 = 1",
                DMatrix::from_row_slice(1, 2, &[1.0, 0.0]),
                DVector::from_vec(vec![1.0]),
            ),
            0,
        )
        .expect("fresh constraint");
    solver
        .add(
            equality_constraint(
                "q = 0",
                DMatrix::identity(2, 2),
                DVector::zeros(2),
            ),
            1,
        )
        .expect("fresh constraint");

    let mut q = DVector::from_vec(vec![0.5, 0.5]);
    let status = solver.solve(&mut q, &mut Constant::default());
    assert_eq!(status, Status::Success);
    // Level 0 wins on q0; level 1 only gets the nullspace, i.e. q1.
    assert_relative_eq!(q[0], 1.0, epsilon = 1e-8);
    assert_relative_eq!(q[1], 0.0, epsilon = 1e-8);
}

#[test]
fn saturation_clipping_reports_infeasible_at_the_bound() {
    let mut solver = HierarchicalSolver::new(ConfigSpace::vector(1));
    solver.set_squared_error_threshold(1e-8);
    solver.set_max_iterations(10);
    solver.set_saturation(Saturation::Bounds {
        lower: DVector::from_vec(vec![0.0]),
        upper: DVector::from_vec(vec![2.0]),
    });
    solver
        .add(
            equality_constraint(
                "unreachable goal",
                DMatrix::from_row_slice(1, 1, &[1.0]),
                DVector::from_vec(vec![5.0]),
            ),
            0,
        )
        .expect("fresh constraint");

    let mut q = DVector::from_vec(vec![1.0]);
    let status = solver.solve(&mut q, &mut Constant::default());
    // The step wants q = 5; saturation clamps to the bound and then
    // zeroes the only column, leaving no descent direction.
    assert_eq!(status, Status::Infeasible);
    assert_relative_eq!(q[0], 2.0, epsilon = 1e-12);
}

#[test]
fn rotation_goal_converges_on_so3() {
    let space = ConfigSpace::Rotation3;
    let mut solver = HierarchicalSolver::new(space.clone());
    solver.set_squared_error_threshold(1e-10);
    solver.set_max_iterations(5);
    let goal = ImplicitConstraint::with_comparison(
        Arc::new(SpaceIdentity::new("orientation goal", space.clone())),
        vec![ComparisonType::Equality; 3],
    );
    solver.add(goal.clone(), 0).expect("fresh constraint");

    // Target: rotation of pi/4 around z.
    let mut target = DVector::zeros(4);
    let angle = std::f64::consts::FRAC_PI_4;
    space.integrate(
        &space.neutral(),
        &DVector::from_vec(vec![0.0, 0.0, angle]),
        &mut target,
    );
    assert!(solver.set_right_hand_side(&goal, &target));

    let mut q = space.neutral();
    let status = solver.solve(&mut q, &mut ErrorNormBased::default());
    assert_eq!(status, Status::Success);

    let mut residual = DVector::zeros(3);
    let satisfied = solver
        .is_constraint_satisfied(&goal, &q, &mut residual)
        .expect("constraint is known");
    assert!(satisfied, "residual {residual:?}");
    // q is the target quaternion (up to sign, but both start from the
    // same hemisphere here).
    for k in 0..4 {
        assert_relative_eq!(q[k], target[k], epsilon = 1e-5);
    }
}

#[test]
fn free_variable_restriction_confines_the_step() {
    let mut solver = HierarchicalSolver::new(ConfigSpace::vector(4));
    solver.set_squared_error_threshold(1e-8);
    solver.set_max_iterations(30);
    solver
        .add(
            equality_constraint(
                "sum equals four",
                DMatrix::from_row_slice(1, 4, &[1.0, 1.0, 1.0, 1.0]),
                DVector::from_vec(vec![4.0]),
            ),
            0,
        )
        .expect("fresh constraint");
    solver.set_free_variables(BlockIndices::range(2, 2));

    let mut q = DVector::zeros(4);
    let status = solver.solve(&mut q, &mut FixedSequence::default());
    assert_eq!(status, Status::Success);
    // Locked variables never move.
    assert_relative_eq!(q[0], 0.0, epsilon = 1e-12);
    assert_relative_eq!(q[1], 0.0, epsilon = 1e-12);
    assert_relative_eq!(q[2] + q[3], 4.0, epsilon = 1e-4);
    // Minimum-norm step splits the goal evenly over the free variables.
    assert_relative_eq!(q[2], 2.0, epsilon = 1e-4);
}

#[test]
fn sigma_tracks_the_smallest_singular_value_across_levels() {
    let mut solver = HierarchicalSolver::new(ConfigSpace::vector(3));
    solver.set_squared_error_threshold(1e-10);
    solver.set_max_iterations(10);
    solver
        .add(
            equality_constraint(
                "scaled rows",
                DMatrix::from_row_slice(2, 3, &[3.0, 0.0, 0.0, 0.0, 0.25, 0.0]),
                DVector::from_vec(vec![0.3, 0.5]),
            ),
            0,
        )
        .expect("fresh constraint");

    let mut q = DVector::zeros(3);
    let status = solver.solve(&mut q, &mut Constant::default());
    assert_eq!(status, Status::Success);
    // Singular values are 3 and 0.25.
    assert!(solver.sigma() <= 0.25 + 1e-9);
    assert!(solver.sigma() > 0.0);
}

#[test]
fn time_parameterized_right_hand_side_is_tracked() {
    let mut solver = HierarchicalSolver::new(ConfigSpace::vector(1));
    solver.set_squared_error_threshold(1e-10);
    solver.set_max_iterations(5);
    let tracking = ImplicitConstraint::with_comparison(
        Arc::new(AffineFunction::new(
            "track",
            DMatrix::from_row_slice(1, 1, &[1.0]),
            DVector::zeros(1),
        )),
        vec![ComparisonType::Equality],
    )
    .with_rhs_function(Arc::new(|s: f64, out: &mut DVector<f64>| {
        out[0] = 2.0 * s;
    }));
    solver.add(tracking.clone(), 0).expect("fresh constraint");

    for s in [0.25, 1.0, -0.5] {
        solver.right_hand_side_at(s);
        let mut q = DVector::zeros(1);
        let status = solver.solve(&mut q, &mut Constant::default());
        assert_eq!(status, Status::Success);
        assert_relative_eq!(q[0], 2.0 * s, epsilon = 1e-6);
    }
}
