use core::convert::TryFrom;

use chacha20::ChaCha8Rng;
use rand_core::SeedableRng;

use tpm_totp::{
    authenticator::Authenticator,
    blob::SealedKeyBlob,
    nv::{self, NvIndex},
    platform::{
        store::{FileStore, RamStore},
        Platform,
    },
    policy::{HashAlgorithm, PcrSelection, SealPolicy},
    secret::Password,
    totp, Error,
};

fn authenticator(seed: u64) -> Authenticator<Platform<RamStore>> {
    let platform = Platform::new(RamStore::default(), ChaCha8Rng::seed_from_u64(seed)).unwrap();
    Authenticator::new(platform)
}

fn assert_no_leaks<S: tpm_totp::platform::store::Store>(authenticator: &Authenticator<Platform<S>>) {
    let platform = authenticator.client().channel();
    assert_eq!(platform.loaded_objects(), 0, "transient objects left behind");
    assert_eq!(platform.active_sessions(), 0, "sessions left behind");
}

fn index() -> NvIndex {
    NvIndex::try_from(0x0100_0001).unwrap()
}

#[test]
fn end_to_end() {
    let mut authenticator = authenticator(1);
    let policy = SealPolicy::platform(PcrSelection::default()).with_password(Password::from("x"));

    let (secret, _) = authenticator.generate(index(), &policy).unwrap();

    let code = authenticator.calculate(index(), 59).unwrap();
    assert_eq!(code.timestamp, 59);
    assert_eq!(code.otp.to_string().len(), 6);
    assert_eq!(code, totp::calculate(secret.as_bytes(), 59));

    assert!(matches!(
        authenticator.recover(index(), &Password::from("wrong")),
        Err(Error::PolicyNotSatisfied)
    ));
    let recovered = authenticator.recover(index(), &Password::from("x")).unwrap();
    assert_eq!(recovered.as_bytes(), secret.as_bytes());

    assert_no_leaks(&authenticator);
}

#[test]
fn platform_state_policy_is_symmetric() {
    let mut authenticator = authenticator(2);
    let selection = PcrSelection::new(HashAlgorithm::Sha256, vec![0, 2, 4, 6]).unwrap();
    authenticator
        .generate(index(), &SealPolicy::platform(selection))
        .unwrap();

    // not part of the selection
    authenticator
        .client_mut()
        .pcr_event(HashAlgorithm::Sha256, 7, b"secure boot policy")
        .unwrap();
    authenticator
        .client_mut()
        .pcr_event(HashAlgorithm::Sha1, 4, b"other bank")
        .unwrap();
    assert!(authenticator.calculate(index(), 1_111_111_109).is_ok());

    authenticator
        .client_mut()
        .pcr_event(HashAlgorithm::Sha256, 4, b"new boot loader")
        .unwrap();
    assert!(matches!(
        authenticator.calculate(index(), 1_111_111_109),
        Err(Error::PolicyNotSatisfied)
    ));
    assert_no_leaks(&authenticator);
}

#[test]
fn reseal_preserves_the_secret() {
    let mut authenticator = authenticator(3);
    let password = Password::from("x");
    let policy = SealPolicy::platform(PcrSelection::default()).with_password(password.clone());
    let (secret, old) = authenticator.generate(index(), &policy).unwrap();

    authenticator
        .client_mut()
        .pcr_event(HashAlgorithm::Sha256, 0, b"firmware update")
        .unwrap();
    assert!(matches!(
        authenticator.calculate(index(), 1_234_567_890),
        Err(Error::PolicyNotSatisfied)
    ));

    let new = authenticator.reseal(index(), &password, &policy).unwrap();
    assert_ne!(new, old);
    assert_eq!(authenticator.load(index()).unwrap(), new);
    assert!(!nv::exists(authenticator.client_mut(), index().staging()).unwrap());

    let code = authenticator.calculate(index(), 1_234_567_890).unwrap();
    assert_eq!(code, totp::calculate(secret.as_bytes(), 1_234_567_890));
    assert_eq!(
        authenticator.recover(index(), &password).unwrap().as_bytes(),
        secret.as_bytes()
    );
    assert_no_leaks(&authenticator);
}

#[test]
fn reseal_with_wrong_password_keeps_the_old_blob() {
    let mut authenticator = authenticator(4);
    let policy = SealPolicy::platform(PcrSelection::default()).with_password(Password::from("x"));
    let (_, old) = authenticator.generate(index(), &policy).unwrap();

    assert!(matches!(
        authenticator.reseal(index(), &Password::from("y"), &policy),
        Err(Error::PolicyNotSatisfied)
    ));
    assert_eq!(authenticator.load(index()).unwrap(), old);
    assert_no_leaks(&authenticator);
}

#[test]
fn interrupted_reseal_falls_back_to_the_staged_blob() {
    let mut authenticator = authenticator(5);
    let password = Password::from("x");
    let policy = SealPolicy::platform(PcrSelection::default()).with_password(password.clone());
    let (secret, old) = authenticator.generate(index(), &policy).unwrap();

    // state right after the swap deleted the primary slot
    let staged = authenticator.reseal_key(&old, &password, &policy).unwrap();
    nv::stage(authenticator.client_mut(), index(), &staged.encode().unwrap()).unwrap();
    authenticator.delete(index()).unwrap();

    assert_eq!(authenticator.load(index()).unwrap(), staged);
    assert!(matches!(
        authenticator.generate(index(), &policy),
        Err(Error::NvAlreadyExists(_))
    ));
    let code = authenticator.calculate(index(), 59).unwrap();
    assert_eq!(code, totp::calculate(secret.as_bytes(), 59));

    // the next reseal completes the swap
    authenticator.reseal(index(), &password, &policy).unwrap();
    assert!(nv::exists(authenticator.client_mut(), index()).unwrap());
    assert!(!nv::exists(authenticator.client_mut(), index().staging()).unwrap());
    assert_no_leaks(&authenticator);
}

#[test]
fn second_clean_reports_not_found() {
    let mut authenticator = authenticator(6);
    authenticator
        .generate(index(), &SealPolicy::platform(PcrSelection::default()))
        .unwrap();

    authenticator.clean(index()).unwrap();
    assert!(matches!(authenticator.clean(index()), Err(Error::NvNotFound(i)) if i == index()));
    assert!(matches!(authenticator.calculate(index(), 59), Err(Error::NvNotFound(_))));

    // the index is free again
    authenticator
        .generate(index(), &SealPolicy::platform(PcrSelection::default()))
        .unwrap();
}

#[test]
fn corrupt_blob_is_a_decode_error() {
    let mut authenticator = authenticator(7);
    nv::store(authenticator.client_mut(), index(), &[0, 9, 0, 1]).unwrap();

    assert!(matches!(authenticator.load(index()), Err(Error::BlobDecode(_))));
    assert_no_leaks(&authenticator);
}

#[test]
fn blob_does_not_unseal_on_another_module() {
    let mut first = authenticator(8);
    let mut second = authenticator(9);
    let policy = SealPolicy::platform(PcrSelection::default()).with_password(Password::from("x"));
    let (_, blob) = first.generate_key(&policy).unwrap();

    let bytes = blob.encode().unwrap();
    let moved = SealedKeyBlob::decode(&bytes).unwrap();
    assert!(second.recover_key(&moved, &Password::from("x")).is_err());
    assert_no_leaks(&second);
}

#[test]
fn key_survives_a_restart_of_the_file_backed_module() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("module.state");
    let policy = SealPolicy::platform(PcrSelection::default()).with_password(Password::from("x"));

    let secret = {
        let platform = Platform::new(FileStore::new(&path), ChaCha8Rng::seed_from_u64(10)).unwrap();
        let mut authenticator = Authenticator::new(platform);
        let (secret, _) = authenticator.generate(NvIndex::DEFAULT, &policy).unwrap();
        secret
    };
    assert!(path.exists());

    let platform = Platform::new(FileStore::new(&path), ChaCha8Rng::seed_from_u64(11)).unwrap();
    let mut authenticator = Authenticator::new(platform);
    let code = authenticator.calculate(NvIndex::DEFAULT, 2_000_000_000).unwrap();
    assert_eq!(code, totp::calculate(secret.as_bytes(), 2_000_000_000));
    assert_no_leaks(&authenticator);
}

#[test]
fn blob_carries_nothing_derived_from_the_password() {
    let mut authenticator = authenticator(12);
    let (_, first) = authenticator
        .generate_key(&SealPolicy::password(Password::from("x")))
        .unwrap();
    let (_, second) = authenticator
        .generate_key(&SealPolicy::password(Password::from("correct horse")))
        .unwrap();

    assert_eq!(first.policy, second.policy);
    assert!(authenticator.recover_key(&first, &Password::from("correct horse")).is_err());
    assert!(authenticator.recover_key(&second, &Password::from("correct horse")).is_ok());
    assert_no_leaks(&authenticator);
}
